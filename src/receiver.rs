//! Inbound routing: decoded frames to typed messages.
//!
//! Routing is a static table keyed by `(class, subtype)`. Frames without an
//! entry are not for the sync engine and pass through untouched.

use tracing::trace;

use crate::ack_manager::AckKind;
use crate::codec::{BankSubtype, Frame, MsgClass, SLOT_REPORT, SLOT_SET};
use crate::contracts::{
    BankChecksum, BankRecord, BankSummary, CommandEcho, ErrorReport, InfoSlot, SlotAck,
};
use crate::errors::CodecError;

/// A frame the sync engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    BankSummary(BankSummary),
    BankRecord(BankRecord),
    BankCommitted(CommandEcho),
    BankChecksum(BankChecksum),
    SlotReport(InfoSlot),
    SlotWritten(SlotAck),
    AutoSwitch(CommandEcho),
    WaypointSwitch(CommandEcho),
    DeviceError(ErrorReport),
}

impl Inbound {
    /// Acknowledgment kind this message satisfies, if any.
    pub fn ack_kind(&self) -> Option<AckKind> {
        Some(match self {
            Self::BankSummary(_) => AckKind::BankSummary,
            Self::BankRecord(_) => AckKind::BankRecord,
            Self::BankCommitted(_) => AckKind::BankCommitted,
            Self::BankChecksum(_) => AckKind::BankChecksum,
            Self::SlotReport(_) => AckKind::SlotReport,
            Self::SlotWritten(_) => AckKind::SlotWritten,
            Self::AutoSwitch(_) => AckKind::AutoSwitch,
            Self::WaypointSwitch(_) => AckKind::WaypointSwitch,
            Self::DeviceError(_) => return None,
        })
    }
}

type Parser = fn(&[u8]) -> Result<Inbound, CodecError>;

fn bank_summary(payload: &[u8]) -> Result<Inbound, CodecError> {
    BankSummary::decode(payload).map(Inbound::BankSummary)
}

fn bank_record(payload: &[u8]) -> Result<Inbound, CodecError> {
    BankRecord::decode(payload).map(Inbound::BankRecord)
}

fn bank_committed(payload: &[u8]) -> Result<Inbound, CodecError> {
    CommandEcho::decode(payload).map(Inbound::BankCommitted)
}

fn bank_checksum(payload: &[u8]) -> Result<Inbound, CodecError> {
    BankChecksum::decode(payload).map(Inbound::BankChecksum)
}

fn slot_report(payload: &[u8]) -> Result<Inbound, CodecError> {
    InfoSlot::decode(payload).map(Inbound::SlotReport)
}

fn slot_written(payload: &[u8]) -> Result<Inbound, CodecError> {
    SlotAck::decode(payload).map(Inbound::SlotWritten)
}

fn auto_switch(payload: &[u8]) -> Result<Inbound, CodecError> {
    CommandEcho::decode(payload).map(Inbound::AutoSwitch)
}

fn waypoint_switch(payload: &[u8]) -> Result<Inbound, CodecError> {
    CommandEcho::decode(payload).map(Inbound::WaypointSwitch)
}

fn device_error(payload: &[u8]) -> Result<Inbound, CodecError> {
    ErrorReport::decode(payload).map(Inbound::DeviceError)
}

static ROUTES: [((MsgClass, u8), Parser); 9] = [
    ((MsgClass::BankAck, BankSubtype::QueryAllBanks as u8), bank_summary),
    ((MsgClass::BankAck, BankSubtype::QuerySingleBank as u8), bank_record),
    ((MsgClass::BankAck, BankSubtype::SetSingleBank as u8), bank_committed),
    ((MsgClass::BankAck, BankSubtype::RefactorInfoSlot as u8), bank_checksum),
    ((MsgClass::BankAck, BankSubtype::EnableBankAutoSwitch as u8), auto_switch),
    ((MsgClass::BankAck, BankSubtype::WaypointAutoSwitch as u8), waypoint_switch),
    ((MsgClass::BankAck, BankSubtype::Error as u8), device_error),
    ((MsgClass::InfoSlot, SLOT_REPORT), slot_report),
    ((MsgClass::InfoSlotAck, SLOT_SET), slot_written),
];

/// Receiver - stateless frame router.
pub struct Receiver;

impl Receiver {
    /// Route `frame` through the dispatch table.
    ///
    /// `Ok(None)` means the frame belongs to another consumer.
    pub fn route(frame: &Frame) -> Result<Option<Inbound>, CodecError> {
        let key = frame.key();
        let Some((_, parse)) = ROUTES.iter().find(|(route, _)| *route == key) else {
            trace!(class = key.0.id(), subtype = key.1, "no route, passing through");
            return Ok(None);
        };
        parse(&frame.payload).map(Some)
    }
}
