//! Mission records exchanged with the vehicle and their payload layouts.
//!
//! All multi-byte fields are little-endian. Every record has a fixed wire
//! length (`WIRE_LEN`); frame payloads are zero-padded past it.

use std::collections::BTreeSet;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{crc8, BankSubtype};
use crate::errors::{CodecError, Result, SyncError};

type CodecResult<T> = std::result::Result<T, CodecError>;

/// Length-checked view of a payload; fields are then read through [`Buf`].
fn reader(payload: &[u8], needed: usize) -> CodecResult<&[u8]> {
    if payload.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: payload.len(),
        });
    }
    Ok(payload)
}

/// Bank state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const LOADED: u8 = 0x01;
    pub const VERIFIED: u8 = 0x02;
    pub const LOCKED: u8 = 0x04;
    pub const OCCUPIED: u8 = 0x08;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn with(self, flag: u8, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    pub fn is_locked(self) -> bool {
        self.contains(Self::LOCKED)
    }

    pub fn is_occupied(self) -> bool {
        self.contains(Self::OCCUPIED)
    }

    pub fn is_verified(self) -> bool {
        self.contains(Self::VERIFIED)
    }
}

/// Vehicle-wide bank capacity, answer to Query-All-Banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankSummary {
    pub large_slot_capacity: u16,
    pub small_slot_capacity: u16,
    pub large_bank_count: u16,
    pub small_bank_count: u16,
    pub transient_bank_id: u16,
}

impl BankSummary {
    pub const WIRE_LEN: usize = 10;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.large_slot_capacity);
        buf.put_u16_le(self.small_slot_capacity);
        buf.put_u16_le(self.large_bank_count);
        buf.put_u16_le(self.small_bank_count);
        buf.put_u16_le(self.transient_bank_id);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            large_slot_capacity: r.get_u16_le(),
            small_slot_capacity: r.get_u16_le(),
            large_bank_count: r.get_u16_le(),
            small_bank_count: r.get_u16_le(),
            transient_bank_id: r.get_u16_le(),
        })
    }
}

/// One bank's header as stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankRecord {
    pub bank_id: u16,
    pub bank_type: u8,
    pub max_slot_capacity: u16,
    pub pending_waypoint_index: u16,
    pub waypoint_count: u16,
    pub info_slot_count: u16,
    pub successor_bank_id: u16,
    pub successor_waypoint_id: u16,
    pub end_action: u8,
    pub state_flags: StateFlags,
    pub switch_state: u8,
}

impl BankRecord {
    pub const WIRE_LEN: usize = 18;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.bank_id);
        buf.put_u8(self.bank_type);
        buf.put_u16_le(self.max_slot_capacity);
        buf.put_u16_le(self.pending_waypoint_index);
        buf.put_u16_le(self.waypoint_count);
        buf.put_u16_le(self.info_slot_count);
        buf.put_u16_le(self.successor_bank_id);
        buf.put_u16_le(self.successor_waypoint_id);
        buf.put_u8(self.end_action);
        buf.put_u8(self.state_flags.bits());
        buf.put_u8(self.switch_state);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            bank_id: r.get_u16_le(),
            bank_type: r.get_u8(),
            max_slot_capacity: r.get_u16_le(),
            pending_waypoint_index: r.get_u16_le(),
            waypoint_count: r.get_u16_le(),
            info_slot_count: r.get_u16_le(),
            successor_bank_id: r.get_u16_le(),
            successor_waypoint_id: r.get_u16_le(),
            end_action: r.get_u8(),
            state_flags: StateFlags::from_bits(r.get_u8()),
            switch_state: r.get_u8(),
        })
    }
}

/// Device answer to Refactor-InfoSlot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankChecksum {
    pub bank_id: u16,
    pub bank_type: u8,
    pub waypoint_count: u16,
    pub info_slot_count: u16,
    pub crc32: u32,
}

impl BankChecksum {
    pub const WIRE_LEN: usize = 11;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.bank_id);
        buf.put_u8(self.bank_type);
        buf.put_u16_le(self.waypoint_count);
        buf.put_u16_le(self.info_slot_count);
        buf.put_u32_le(self.crc32);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            bank_id: r.get_u16_le(),
            bank_type: r.get_u8(),
            waypoint_count: r.get_u16_le(),
            info_slot_count: r.get_u16_le(),
            crc32: r.get_u32_le(),
        })
    }

    /// Whether the device rebuilt the bank we uploaded.
    ///
    /// TODO: crc32 is not recomputed locally until the device's checksum
    /// coverage is confirmed; only ids and counts are compared.
    pub fn matches(&self, target: &BankRecord) -> bool {
        self.bank_id == target.bank_id
            && self.waypoint_count == target.waypoint_count
            && self.info_slot_count == target.info_slot_count
    }
}

/// Why the device rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    IndexOutOfRange,
    InvalidCommand,
    Unknown(u8),
}

impl Diagnostic {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IndexOutOfRange,
            0x02 => Self::InvalidCommand,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::IndexOutOfRange => 0x01,
            Self::InvalidCommand => 0x02,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange => write!(f, "index out of range"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::Unknown(code) => write!(f, "unknown diagnostic {code:#04x}"),
        }
    }
}

/// Payload of the bank Error subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub failing_subtype: u8,
    pub diagnostic: Diagnostic,
}

impl ErrorReport {
    pub const WIRE_LEN: usize = 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u8(self.failing_subtype);
        buf.put_u8(self.diagnostic.code());
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            failing_subtype: r.get_u8(),
            diagnostic: Diagnostic::from_code(r.get_u8()),
        })
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (subtype {:#04x})", self.diagnostic, self.failing_subtype)
    }
}

/// One waypoint-behavior record; the unit of upload and download.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InfoSlot {
    pub bank_id: u16,
    pub waypoint_id: u16,
    pub slot_id: u16,
    pub slot_type_bits: u8,
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f32,
    pub switch_radius: f32,
    pub reference_ground_speed: f32,
    pub reference_climb_rate: f32,
    pub switch_delay: u16,
    pub switch_speed_threshold: f32,
    pub switch_heading_threshold: f32,
    pub departure_action_bits: u16,
    pub arrival_action_bits: u16,
    pub switch_condition_bits: u16,
    pub in_flight_action: u8,
    pub height_heading_control_mode_bits: u8,
    pub switch_angle: f32,
    pub switch_turns: u8,
    pub guidance_mode: u8,
    pub maneuver_style_bits: u8,
    pub transition_style: u8,
    pub reserved0: u32,
    pub reserved1: u32,
    pub checksum: u8,
}

impl InfoSlot {
    pub const WIRE_LEN: usize = 74;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.bank_id);
        buf.put_u16_le(self.waypoint_id);
        buf.put_u16_le(self.slot_id);
        buf.put_u8(self.slot_type_bits);
        buf.put_f64_le(self.longitude);
        buf.put_f64_le(self.latitude);
        buf.put_f32_le(self.altitude);
        buf.put_f32_le(self.switch_radius);
        buf.put_f32_le(self.reference_ground_speed);
        buf.put_f32_le(self.reference_climb_rate);
        buf.put_u16_le(self.switch_delay);
        buf.put_f32_le(self.switch_speed_threshold);
        buf.put_f32_le(self.switch_heading_threshold);
        buf.put_u16_le(self.departure_action_bits);
        buf.put_u16_le(self.arrival_action_bits);
        buf.put_u16_le(self.switch_condition_bits);
        buf.put_u8(self.in_flight_action);
        buf.put_u8(self.height_heading_control_mode_bits);
        buf.put_f32_le(self.switch_angle);
        buf.put_u8(self.switch_turns);
        buf.put_u8(self.guidance_mode);
        buf.put_u8(self.maneuver_style_bits);
        buf.put_u8(self.transition_style);
        buf.put_u32_le(self.reserved0);
        buf.put_u32_le(self.reserved1);
        buf.put_u8(self.checksum);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            bank_id: r.get_u16_le(),
            waypoint_id: r.get_u16_le(),
            slot_id: r.get_u16_le(),
            slot_type_bits: r.get_u8(),
            longitude: r.get_f64_le(),
            latitude: r.get_f64_le(),
            altitude: r.get_f32_le(),
            switch_radius: r.get_f32_le(),
            reference_ground_speed: r.get_f32_le(),
            reference_climb_rate: r.get_f32_le(),
            switch_delay: r.get_u16_le(),
            switch_speed_threshold: r.get_f32_le(),
            switch_heading_threshold: r.get_f32_le(),
            departure_action_bits: r.get_u16_le(),
            arrival_action_bits: r.get_u16_le(),
            switch_condition_bits: r.get_u16_le(),
            in_flight_action: r.get_u8(),
            height_heading_control_mode_bits: r.get_u8(),
            switch_angle: r.get_f32_le(),
            switch_turns: r.get_u8(),
            guidance_mode: r.get_u8(),
            maneuver_style_bits: r.get_u8(),
            transition_style: r.get_u8(),
            reserved0: r.get_u32_le(),
            reserved1: r.get_u32_le(),
            checksum: r.get_u8(),
        })
    }

    /// CRC8 over the encoded record minus its trailing checksum byte.
    pub fn compute_checksum(&self) -> u8 {
        let bytes = self.encode();
        crc8(&bytes[..Self::WIRE_LEN - 1])
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn sealed(mut self) -> Self {
        self.seal();
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Device acknowledgment of a Set-Single-InfoSlot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotAck {
    pub bank_id: u16,
    pub waypoint_id: u16,
    pub slot_id: u16,
    pub checksum: u8,
    pub status: u8,
}

impl SlotAck {
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.bank_id);
        buf.put_u16_le(self.waypoint_id);
        buf.put_u16_le(self.slot_id);
        buf.put_u8(self.checksum);
        buf.put_u8(self.status);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            bank_id: r.get_u16_le(),
            waypoint_id: r.get_u16_le(),
            slot_id: r.get_u16_le(),
            checksum: r.get_u8(),
            status: r.get_u8(),
        })
    }
}

/// Echo returned for Set-Single-Bank and the auto-switch commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandEcho {
    pub bank_id: u16,
    pub value: u16,
    pub status: u8,
}

impl CommandEcho {
    pub const WIRE_LEN: usize = 5;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u16_le(self.bank_id);
        buf.put_u16_le(self.value);
        buf.put_u8(self.status);
        Vec::from(buf)
    }

    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut r = reader(payload, Self::WIRE_LEN)?;
        Ok(Self {
            bank_id: r.get_u16_le(),
            value: r.get_u16_le(),
            status: r.get_u8(),
        })
    }
}

/// Requests in the bank command domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankRequest {
    QueryAllBanks,
    QuerySingleBank { bank_id: u16 },
    SetSingleBank(BankRecord),
    RefactorInfoSlot {
        bank_id: u16,
        waypoint_count: u16,
        info_slot_count: u16,
    },
    QuerySingleInfoSlot { bank_id: u16, slot_id: u16 },
    EnableBankAutoSwitch { bank_id: u16, enable: bool },
    WaypointAutoSwitch { bank_id: u16, waypoint_id: u16 },
}

impl BankRequest {
    pub fn subtype(&self) -> BankSubtype {
        match self {
            Self::QueryAllBanks => BankSubtype::QueryAllBanks,
            Self::QuerySingleBank { .. } => BankSubtype::QuerySingleBank,
            Self::SetSingleBank(_) => BankSubtype::SetSingleBank,
            Self::RefactorInfoSlot { .. } => BankSubtype::RefactorInfoSlot,
            Self::QuerySingleInfoSlot { .. } => BankSubtype::QuerySingleInfoSlot,
            Self::EnableBankAutoSwitch { .. } => BankSubtype::EnableBankAutoSwitch,
            Self::WaypointAutoSwitch { .. } => BankSubtype::WaypointAutoSwitch,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BankRecord::WIRE_LEN);
        match *self {
            Self::QueryAllBanks => {}
            Self::QuerySingleBank { bank_id } => buf.put_u16_le(bank_id),
            Self::SetSingleBank(record) => return record.encode(),
            Self::RefactorInfoSlot {
                bank_id,
                waypoint_count,
                info_slot_count,
            } => {
                buf.put_u16_le(bank_id);
                buf.put_u16_le(waypoint_count);
                buf.put_u16_le(info_slot_count);
            }
            Self::QuerySingleInfoSlot { bank_id, slot_id } => {
                buf.put_u16_le(bank_id);
                buf.put_u16_le(slot_id);
            }
            Self::EnableBankAutoSwitch { bank_id, enable } => {
                buf.put_u16_le(bank_id);
                buf.put_u8(u8::from(enable));
            }
            Self::WaypointAutoSwitch {
                bank_id,
                waypoint_id,
            } => {
                buf.put_u16_le(bank_id);
                buf.put_u16_le(waypoint_id);
            }
        }
        Vec::from(buf)
    }

    /// Parse a request payload (device side).
    pub fn decode(subtype: u8, payload: &[u8]) -> CodecResult<Self> {
        let kind = BankSubtype::from_u8(subtype).ok_or(CodecError::UnexpectedKind {
            class: crate::codec::MsgClass::BankCommand.id(),
            subtype,
        })?;
        Ok(match kind {
            BankSubtype::QueryAllBanks => Self::QueryAllBanks,
            BankSubtype::QuerySingleBank => {
                let mut r = reader(payload, 2)?;
                Self::QuerySingleBank { bank_id: r.get_u16_le() }
            }
            BankSubtype::SetSingleBank => Self::SetSingleBank(BankRecord::decode(payload)?),
            BankSubtype::RefactorInfoSlot => {
                let mut r = reader(payload, 6)?;
                Self::RefactorInfoSlot {
                    bank_id: r.get_u16_le(),
                    waypoint_count: r.get_u16_le(),
                    info_slot_count: r.get_u16_le(),
                }
            }
            BankSubtype::QuerySingleInfoSlot => {
                let mut r = reader(payload, 4)?;
                Self::QuerySingleInfoSlot {
                    bank_id: r.get_u16_le(),
                    slot_id: r.get_u16_le(),
                }
            }
            BankSubtype::EnableBankAutoSwitch => {
                let mut r = reader(payload, 3)?;
                Self::EnableBankAutoSwitch {
                    bank_id: r.get_u16_le(),
                    enable: r.get_u8() != 0,
                }
            }
            BankSubtype::WaypointAutoSwitch => {
                let mut r = reader(payload, 4)?;
                Self::WaypointAutoSwitch {
                    bank_id: r.get_u16_le(),
                    waypoint_id: r.get_u16_le(),
                }
            }
            BankSubtype::Error => {
                return Err(CodecError::UnexpectedKind {
                    class: crate::codec::MsgClass::BankCommand.id(),
                    subtype,
                })
            }
        })
    }
}

impl fmt::Display for BankRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueryAllBanks => write!(f, "query all banks"),
            Self::QuerySingleBank { bank_id } => write!(f, "query bank {bank_id}"),
            Self::SetSingleBank(record) => write!(f, "commit bank {}", record.bank_id),
            Self::RefactorInfoSlot { bank_id, .. } => write!(f, "refactor bank {bank_id}"),
            Self::QuerySingleInfoSlot { bank_id, slot_id } => {
                write!(f, "download bank {bank_id} slot {slot_id}")
            }
            Self::EnableBankAutoSwitch { bank_id, enable } => {
                let verb = if *enable { "enable" } else { "disable" };
                write!(f, "{verb} auto switch on bank {bank_id}")
            }
            Self::WaypointAutoSwitch {
                bank_id,
                waypoint_id,
            } => write!(f, "switch to bank {bank_id} waypoint {waypoint_id}"),
        }
    }
}

/// One bank together with its info-slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MissionBank {
    pub record: BankRecord,
    pub slots: Vec<InfoSlot>,
}

impl MissionBank {
    /// Prepare a bank for upload: slots are re-addressed to the bank and
    /// numbered by position, sealed, and the record's counts are recomputed
    /// from them.
    ///
    /// A bank can address at most `u16::MAX` info-slots; more is reported as
    /// [`SyncError::InsufficientCapacity`].
    pub fn new(mut record: BankRecord, slots: Vec<InfoSlot>) -> Result<Self> {
        let info_slot_count =
            u16::try_from(slots.len()).map_err(|_| SyncError::InsufficientCapacity {
                what: "info-slots per bank",
                required: slots.len(),
                available: usize::from(u16::MAX),
            })?;
        let slots: Vec<InfoSlot> = slots
            .into_iter()
            .zip(0u16..)
            .map(|(mut slot, slot_id)| {
                slot.bank_id = record.bank_id;
                slot.slot_id = slot_id;
                slot.sealed()
            })
            .collect();
        let waypoints: BTreeSet<u16> = slots.iter().map(|slot| slot.waypoint_id).collect();
        record.info_slot_count = info_slot_count;
        // Never more distinct waypoints than slots.
        record.waypoint_count = waypoints.len() as u16;
        Ok(Self { record, slots })
    }
}

/// A complete mission: every bank with its info-slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mission {
    pub banks: Vec<MissionBank>,
}

impl Mission {
    /// Pair bank records with their slot lists; missing lists are empty.
    pub fn from_parts(records: Vec<BankRecord>, slots: Vec<Vec<InfoSlot>>) -> Result<Self> {
        let mut slots = slots.into_iter();
        let banks = records
            .into_iter()
            .map(|record| MissionBank::new(record, slots.next().unwrap_or_default()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { banks })
    }

    pub fn into_parts(self) -> (Vec<BankRecord>, Vec<Vec<InfoSlot>>) {
        self.banks
            .into_iter()
            .map(|bank| (bank.record, bank.slots))
            .unzip()
    }

    pub fn slot_count(&self) -> usize {
        self.banks.iter().map(|bank| bank.slots.len()).sum()
    }
}
