use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use missionlink_core::codec::{self, encode_with_sequence, FrameBuffer, SLOT_SET};
use missionlink_core::contracts::{BankRecord, InfoSlot, MissionBank};
use missionlink_core::sim::SimulatedVehicle;
use missionlink_core::{Frame, MsgClass, SyncConfig, VehicleBridge};

fn slot_frame() -> Frame {
    let slot = InfoSlot {
        waypoint_id: 3,
        longitude: 8.5417,
        latitude: 47.3769,
        altitude: 120.0,
        ..Default::default()
    }
    .sealed();
    Frame::new(MsgClass::InfoSlot, SLOT_SET, 0x00FE, 0x0001, slot.encode())
}

fn benchmark_encode(c: &mut Criterion) {
    let frame = slot_frame();

    c.bench_function("encode_info_slot_frame", |b| {
        b.iter(|| encode_with_sequence(black_box(&frame), black_box(7)));
    });
}

fn benchmark_decode_stream(c: &mut Criterion) {
    let frame = slot_frame();
    let stream: Vec<u8> = (0..64u8).flat_map(|seq| encode_with_sequence(&frame, seq)).collect();

    c.bench_function("decode_64_frame_stream", |b| {
        b.iter(|| {
            let mut buffer = FrameBuffer::with_capacity(4096);
            codec::decode(&mut buffer, black_box(&stream))
        });
    });
}

fn benchmark_simulated_read(c: &mut Criterion) {
    let mut vehicle = SimulatedVehicle::new(0x0001, 4, 32);
    for bank_id in 0..4u16 {
        let slots = vec![InfoSlot::default(); 16];
        vehicle.load_bank(MissionBank::new(
            BankRecord {
                bank_id,
                ..Default::default()
            },
            slots,
        )
        .unwrap());
    }

    c.bench_function("read_4_banks_64_slots", |b| {
        b.iter(|| {
            let mut bridge = VehicleBridge::new(SyncConfig::default()).unwrap();
            let now = Instant::now();
            let mut outbound = bridge.start_read(now).unwrap().outbound;
            while !outbound.is_empty() {
                let mut next = Vec::new();
                for request in outbound {
                    let reply = vehicle.process(&request);
                    next.extend(bridge.on_bytes(&reply, now).outbound);
                }
                outbound = next;
            }
            vehicle.clear_received();
            black_box(bridge.is_active())
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode_stream,
    benchmark_simulated_read
);
criterion_main!(benches);
