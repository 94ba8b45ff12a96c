//! Simulated flight controller for tests, benches and bench-top demos.
//!
//! [`SimulatedVehicle`] answers the bank command domain the way the device
//! does, with knobs for the failures a real link produces. [`LossyLink`]
//! fragments and corrupts byte chunks with a seeded RNG so runs repeat.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::channel::ChannelState;
use crate::codec::{self, BankSubtype, Frame, MsgClass, SLOT_REPORT, SLOT_SET};
use crate::contracts::{
    BankChecksum, BankRecord, BankRequest, BankSummary, CommandEcho, Diagnostic, ErrorReport,
    InfoSlot, MissionBank, SlotAck,
};

/// Failure injection. Counters are decremented as they fire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Never answer anything
    pub silent: bool,
    /// Swallow the next N requests
    pub drop_next: u32,
    /// Echo a wrong checksum in the next N slot acknowledgments
    pub corrupt_slot_acks: u32,
    /// Answer the next N slot queries with the neighbouring slot
    pub misroute_slot_reports: u32,
}

#[derive(Debug, Clone, Default)]
struct StoredBank {
    record: BankRecord,
    slots: BTreeMap<u16, InfoSlot>,
}

impl StoredBank {
    fn active_slots(&self) -> impl Iterator<Item = &InfoSlot> {
        let count = self.record.info_slot_count;
        self.slots.range(..count).map(|(_, slot)| slot)
    }
}

/// Bank storage plus the request handling of one vehicle.
#[derive(Debug)]
pub struct SimulatedVehicle {
    id: u16,
    summary: BankSummary,
    banks: Vec<StoredBank>,
    faults: Faults,
    channel: ChannelState,
    received: Vec<Frame>,
}

impl SimulatedVehicle {
    /// Vehicle `id` with `bank_count` empty banks of `slot_capacity` slots.
    pub fn new(id: u16, bank_count: u16, slot_capacity: u16) -> Self {
        let banks = (0..bank_count)
            .map(|bank_id| StoredBank {
                record: BankRecord {
                    bank_id,
                    max_slot_capacity: slot_capacity,
                    ..Default::default()
                },
                slots: BTreeMap::new(),
            })
            .collect();
        Self {
            id,
            summary: BankSummary {
                large_slot_capacity: slot_capacity,
                small_slot_capacity: 0,
                large_bank_count: bank_count,
                small_bank_count: 0,
                transient_bank_id: bank_count,
            },
            banks,
            faults: Faults::default(),
            channel: ChannelState::new(crate::RECEIVE_BUFFER_CAPACITY, crate::STATS_WINDOW),
            received: Vec::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn summary(&self) -> BankSummary {
        self.summary
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Every request addressed to this vehicle, in arrival order.
    pub fn received(&self) -> &[Frame] {
        &self.received
    }

    pub fn clear_received(&mut self) {
        self.received.clear();
    }

    /// Overwrite a bank's stored contents directly.
    pub fn load_bank(&mut self, bank: MissionBank) {
        let Some(stored) = self.banks.get_mut(usize::from(bank.record.bank_id)) else {
            return;
        };
        stored.record = bank.record;
        stored.slots = bank.slots.into_iter().map(|slot| (slot.slot_id, slot)).collect();
    }

    /// Stored record and active slots of `bank_id`.
    pub fn bank(&self, bank_id: u16) -> Option<MissionBank> {
        self.banks.get(usize::from(bank_id)).map(|stored| MissionBank {
            record: stored.record,
            slots: stored.active_slots().copied().collect(),
        })
    }

    /// Handle one decoded request; returns the reply frames.
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.target_id != self.id {
            return Vec::new();
        }
        self.received.push(frame.clone());

        if self.faults.silent {
            return Vec::new();
        }
        if self.faults.drop_next > 0 {
            self.faults.drop_next -= 1;
            debug!(class = frame.class.id(), subtype = frame.subtype, "sim: dropping request");
            return Vec::new();
        }

        let reply = match frame.key() {
            (MsgClass::BankCommand, subtype) => match BankRequest::decode(subtype, &frame.payload) {
                Ok(request) => self.on_bank_request(request),
                Err(_) => error_reply(subtype, Diagnostic::InvalidCommand),
            },
            (MsgClass::InfoSlot, SLOT_SET) => match InfoSlot::decode(&frame.payload) {
                Ok(slot) => self.on_slot_upload(slot),
                Err(_) => error_reply(frame.subtype, Diagnostic::InvalidCommand),
            },
            _ => return Vec::new(),
        };

        let (class, subtype, payload) = reply;
        vec![Frame::new(class, subtype, self.id, frame.source_id, payload)]
    }

    /// Decode a chunk of request bytes and return the encoded replies.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for request in self.channel.decode(bytes) {
            self.channel.record(&request);
            for reply in self.handle(&request) {
                out.extend(codec::encode(&reply, &mut self.channel));
            }
        }
        out
    }

    /// Serve requests over a byte stream until it closes.
    pub async fn serve<S>(mut self, mut stream: S) -> std::io::Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(self);
            }
            let reply = self.process(&buf[..n]);
            if !reply.is_empty() {
                stream.write_all(&reply).await?;
            }
        }
    }

    fn on_bank_request(&mut self, request: BankRequest) -> (MsgClass, u8, Vec<u8>) {
        let subtype = request.subtype().as_u8();
        let ack = |payload: Vec<u8>| (MsgClass::BankAck, subtype, payload);

        match request {
            BankRequest::QueryAllBanks => ack(self.summary.encode()),
            BankRequest::QuerySingleBank { bank_id } => match self.banks.get(usize::from(bank_id)) {
                Some(stored) => ack(stored.record.encode()),
                None => error_reply(subtype, Diagnostic::IndexOutOfRange),
            },
            BankRequest::SetSingleBank(record) => {
                let Some(stored) = self.banks.get_mut(usize::from(record.bank_id)) else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                let count = record.info_slot_count;
                stored.slots.retain(|&slot_id, _| slot_id < count);
                stored.record = BankRecord {
                    max_slot_capacity: stored.record.max_slot_capacity,
                    ..record
                };
                ack(CommandEcho {
                    bank_id: record.bank_id,
                    value: count,
                    status: 0,
                }
                .encode())
            }
            BankRequest::RefactorInfoSlot {
                bank_id,
                info_slot_count,
                ..
            } => {
                let Some(stored) = self.banks.get_mut(usize::from(bank_id)) else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                let present: Vec<InfoSlot> = stored
                    .slots
                    .range(..info_slot_count)
                    .map(|(_, slot)| *slot)
                    .collect();
                let waypoints: BTreeSet<u16> =
                    present.iter().map(|slot| slot.waypoint_id).collect();
                let mut hasher = crc32fast::Hasher::new();
                for slot in &present {
                    hasher.update(&slot.encode());
                }
                stored.record.info_slot_count = u16::try_from(present.len()).unwrap_or(u16::MAX);
                stored.record.waypoint_count = u16::try_from(waypoints.len()).unwrap_or(u16::MAX);
                ack(BankChecksum {
                    bank_id,
                    bank_type: stored.record.bank_type,
                    waypoint_count: stored.record.waypoint_count,
                    info_slot_count: stored.record.info_slot_count,
                    crc32: hasher.finalize(),
                }
                .encode())
            }
            BankRequest::QuerySingleInfoSlot { bank_id, slot_id } => {
                let Some(stored) = self.banks.get(usize::from(bank_id)) else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                let Some(mut slot) = stored.slots.get(&slot_id).copied() else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                if self.faults.misroute_slot_reports > 0 {
                    self.faults.misroute_slot_reports -= 1;
                    slot.slot_id = slot.slot_id.wrapping_add(1);
                }
                (MsgClass::InfoSlot, SLOT_REPORT, slot.encode())
            }
            BankRequest::EnableBankAutoSwitch { bank_id, enable } => {
                let Some(stored) = self.banks.get_mut(usize::from(bank_id)) else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                stored.record.switch_state = u8::from(enable);
                ack(CommandEcho {
                    bank_id,
                    value: u16::from(enable),
                    status: 0,
                }
                .encode())
            }
            BankRequest::WaypointAutoSwitch { bank_id, waypoint_id } => {
                let Some(stored) = self.banks.get_mut(usize::from(bank_id)) else {
                    return error_reply(subtype, Diagnostic::IndexOutOfRange);
                };
                stored.record.pending_waypoint_index = waypoint_id;
                ack(CommandEcho {
                    bank_id,
                    value: waypoint_id,
                    status: 0,
                }
                .encode())
            }
        }
    }

    fn on_slot_upload(&mut self, slot: InfoSlot) -> (MsgClass, u8, Vec<u8>) {
        let capacity = self.summary.large_slot_capacity;
        let Some(stored) = self.banks.get_mut(usize::from(slot.bank_id)) else {
            return error_reply(SLOT_SET, Diagnostic::IndexOutOfRange);
        };
        if slot.slot_id >= capacity {
            return error_reply(SLOT_SET, Diagnostic::IndexOutOfRange);
        }

        let status = u8::from(!slot.is_sealed());
        stored.slots.insert(slot.slot_id, slot);

        let mut checksum = slot.checksum;
        if self.faults.corrupt_slot_acks > 0 {
            self.faults.corrupt_slot_acks -= 1;
            checksum ^= 0xFF;
        }
        let ack = SlotAck {
            bank_id: slot.bank_id,
            waypoint_id: slot.waypoint_id,
            slot_id: slot.slot_id,
            checksum,
            status,
        };
        (MsgClass::InfoSlotAck, SLOT_SET, ack.encode())
    }
}

fn error_reply(failing_subtype: u8, diagnostic: Diagnostic) -> (MsgClass, u8, Vec<u8>) {
    let report = ErrorReport {
        failing_subtype,
        diagnostic,
    };
    (MsgClass::BankAck, BankSubtype::Error.as_u8(), report.encode())
}

/// Byte pipe that splits chunks at random points and flips random bits.
#[derive(Debug)]
pub struct LossyLink {
    rng: StdRng,
    max_chunk: usize,
    corrupt_probability: f64,
}

impl LossyLink {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            max_chunk: 16,
            corrupt_probability: 0.0,
        }
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    /// Per-byte probability of a single flipped bit.
    pub fn with_corruption(mut self, probability: f64) -> Self {
        self.corrupt_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Carry `bytes` across the link, returning the chunks as delivered.
    pub fn carry(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut data = bytes.to_vec();
        if self.corrupt_probability > 0.0 {
            for byte in &mut data {
                if self.rng.gen_bool(self.corrupt_probability) {
                    *byte ^= 1 << self.rng.gen_range(0..8u8);
                }
            }
        }

        let mut chunks = Vec::new();
        let mut rest = data.as_slice();
        while !rest.is_empty() {
            let len = self.rng.gen_range(1..=self.max_chunk).min(rest.len());
            let (chunk, tail) = rest.split_at(len);
            chunks.push(chunk.to_vec());
            rest = tail;
        }
        chunks
    }
}
