//! Frame codec for the vehicle link.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! [magic 2][class 1][subtype 1][source 2][target 2][payload N][counter 1][crc8 1]
//! ```
//!
//! `N` is fixed per message class (see [`MsgClass::payload_len`]). The CRC8
//! covers every byte before it, magic included.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::channel::ChannelState;

/// Two-byte frame preamble
pub const MAGIC: [u8; 2] = [0xEB, 0x90];

/// Bytes before the payload: magic, class, subtype, source, target
pub const HEADER_LEN: usize = 8;

/// Bytes after the payload: rolling counter, CRC8
pub const TRAILER_LEN: usize = 2;

/// Header plus trailer
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

const CLASS_OFFSET: usize = 2;

/// Largest frame any message class can produce
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MsgClass::MAX_PAYLOAD_LEN;

/// Message classes and their fixed payload sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgClass {
    InfoSlot = 0x01,
    GeneralStatus = 0x02,
    PositionVelocityTime = 0x03,
    Attitude = 0x04,
    GeneralData = 0x05,
    VehicleCommand = 0x10,
    ParamCommand = 0x11,
    BankCommand = 0x12,
    PayloadCommand = 0x13,
    RemoteControlCommand = 0x14,
    CommCommand = 0x15,
    OrganizeCommand = 0x16,
    InfoSlotAck = 0x81,
    VehicleAck = 0x90,
    ParamAck = 0x91,
    BankAck = 0x92,
    PayloadAck = 0x93,
    RemoteControlAck = 0x94,
    CommAck = 0x95,
    OrganizeAck = 0x96,
}

impl MsgClass {
    pub const ALL: [MsgClass; 20] = [
        Self::InfoSlot,
        Self::GeneralStatus,
        Self::PositionVelocityTime,
        Self::Attitude,
        Self::GeneralData,
        Self::VehicleCommand,
        Self::ParamCommand,
        Self::BankCommand,
        Self::PayloadCommand,
        Self::RemoteControlCommand,
        Self::CommCommand,
        Self::OrganizeCommand,
        Self::InfoSlotAck,
        Self::VehicleAck,
        Self::ParamAck,
        Self::BankAck,
        Self::PayloadAck,
        Self::RemoteControlAck,
        Self::CommAck,
        Self::OrganizeAck,
    ];

    pub const MAX_PAYLOAD_LEN: usize = 74;

    /// Look up a class from its wire id. Unknown ids cannot be sized.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|class| class.id() == id)
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Payload size declared for this class
    pub fn payload_len(self) -> usize {
        match self {
            Self::InfoSlot => crate::contracts::InfoSlot::WIRE_LEN,
            Self::GeneralStatus => 40,
            Self::PositionVelocityTime => 56,
            Self::Attitude => 28,
            Self::GeneralData => 64,
            Self::VehicleCommand => 16,
            Self::ParamCommand => 24,
            Self::BankCommand => 24,
            Self::PayloadCommand => 16,
            Self::RemoteControlCommand => 20,
            Self::CommCommand => 16,
            Self::OrganizeCommand => 16,
            Self::InfoSlotAck => 8,
            Self::BankAck => 32,
            Self::VehicleAck
            | Self::ParamAck
            | Self::PayloadAck
            | Self::RemoteControlAck
            | Self::CommAck
            | Self::OrganizeAck => 16,
        }
    }

    /// Total encoded size of a frame of this class
    pub fn frame_len(self) -> usize {
        FRAME_OVERHEAD + self.payload_len()
    }
}

/// Subtypes within [`MsgClass::BankCommand`] and [`MsgClass::BankAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BankSubtype {
    QueryAllBanks = 0x01,
    QuerySingleBank = 0x02,
    SetSingleBank = 0x03,
    RefactorInfoSlot = 0x04,
    QuerySingleInfoSlot = 0x05,
    EnableBankAutoSwitch = 0x06,
    WaypointAutoSwitch = 0x07,
    Error = 0xEE,
}

impl BankSubtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::QueryAllBanks,
            0x02 => Self::QuerySingleBank,
            0x03 => Self::SetSingleBank,
            0x04 => Self::RefactorInfoSlot,
            0x05 => Self::QuerySingleInfoSlot,
            0x06 => Self::EnableBankAutoSwitch,
            0x07 => Self::WaypointAutoSwitch,
            0xEE => Self::Error,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Upload of one info-slot (ground to device), also used for the write ack
pub const SLOT_SET: u8 = 0x01;

/// Info-slot answer to a Query-Single-InfoSlot (device to ground)
pub const SLOT_REPORT: u8 = 0x02;

const CRC8_POLY_REFLECTED: u8 = 0xE0;

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC8_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = build_crc8_table();

/// Reflected table-driven CRC8, init 0xFF, xorout 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
    let crc = data
        .iter()
        .fold(0xFFu8, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize]);
    crc ^ 0xFF
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub class: MsgClass,
    pub subtype: u8,
    pub source_id: u16,
    pub target_id: u16,
    /// Always exactly `class.payload_len()` bytes
    pub payload: Vec<u8>,
    /// Rolling counter, assigned at encode time
    pub sequence: u8,
    /// CRC8 as seen on the wire, assigned at encode time
    pub checksum: u8,
}

impl Frame {
    /// Build a frame, zero-padding or truncating `payload` to the class size.
    pub fn new(
        class: MsgClass,
        subtype: u8,
        source_id: u16,
        target_id: u16,
        mut payload: Vec<u8>,
    ) -> Self {
        payload.resize(class.payload_len(), 0);
        Self {
            class,
            subtype,
            source_id,
            target_id,
            payload,
            sequence: 0,
            checksum: 0,
        }
    }

    /// `(class, subtype)` dispatch key
    pub fn key(&self) -> (MsgClass, u8) {
        (self.class, self.subtype)
    }

    /// `raw` is one CRC-checked frame of exactly `class.frame_len()` bytes.
    fn parse(mut raw: &[u8], class: MsgClass) -> Self {
        raw.advance(CLASS_OFFSET + 1);
        let subtype = raw.get_u8();
        let source_id = raw.get_u16_le();
        let target_id = raw.get_u16_le();
        let payload = raw[..class.payload_len()].to_vec();
        raw.advance(class.payload_len());
        Self {
            class,
            subtype,
            source_id,
            target_id,
            payload,
            sequence: raw.get_u8(),
            checksum: raw.get_u8(),
        }
    }
}

/// Encode `frame` with an explicit counter value.
pub fn encode_with_sequence(frame: &Frame, sequence: u8) -> Vec<u8> {
    let payload_len = frame.class.payload_len();
    let mut bytes = BytesMut::with_capacity(FRAME_OVERHEAD + payload_len);
    bytes.put_slice(&MAGIC);
    bytes.put_u8(frame.class.id());
    bytes.put_u8(frame.subtype);
    bytes.put_u16_le(frame.source_id);
    bytes.put_u16_le(frame.target_id);

    let copied = frame.payload.len().min(payload_len);
    bytes.put_slice(&frame.payload[..copied]);
    bytes.put_bytes(0, payload_len - copied);

    bytes.put_u8(sequence);
    let crc = crc8(&bytes);
    bytes.put_u8(crc);
    Vec::from(bytes)
}

/// Encode `frame`, stamping it with the channel's next rolling counter.
pub fn encode(frame: &Frame, channel: &mut ChannelState) -> Vec<u8> {
    encode_with_sequence(frame, channel.next_sequence())
}

/// Accumulation buffer for one channel's inbound bytes.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: BytesMut,
    capacity: usize,
}

impl FrameBuffer {
    /// `capacity` is raised to [`MAX_FRAME_LEN`] if smaller.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FRAME_LEN);
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Append `bytes` to `buffer` and pull out every complete, valid frame.
///
/// A partial frame at the end of the buffer is kept for the next call. A
/// candidate whose CRC does not match is treated as a false magic and the
/// scan resumes one byte later.
pub fn decode(buffer: &mut FrameBuffer, mut bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let room = buffer.capacity - buffer.data.len();
        let take = room.min(bytes.len());
        buffer.data.extend_from_slice(&bytes[..take]);
        bytes = &bytes[take..];

        scan(buffer, &mut frames);

        if bytes.is_empty() {
            return frames;
        }
    }
}

fn scan(buffer: &mut FrameBuffer, frames: &mut Vec<Frame>) {
    let data = &buffer.data[..];
    let mut cursor = 0;

    while cursor + MAGIC.len() <= data.len() {
        if data[cursor..cursor + MAGIC.len()] != MAGIC {
            cursor += 1;
            continue;
        }

        let Some(&class_id) = data.get(cursor + CLASS_OFFSET) else {
            break;
        };
        let Some(class) = MsgClass::from_id(class_id) else {
            cursor += 1;
            continue;
        };

        let frame_len = class.frame_len();
        if data.len() - cursor < frame_len {
            break;
        }

        let candidate = &data[cursor..cursor + frame_len];
        let expected = crc8(&candidate[..frame_len - 1]);
        if expected != candidate[frame_len - 1] {
            trace!(
                offset = cursor,
                class = class_id,
                "crc mismatch, resynchronizing"
            );
            cursor += 1;
            continue;
        }

        frames.push(Frame::parse(candidate, class));
        cursor += frame_len;
    }

    buffer.data.advance(cursor);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank_query() -> Frame {
        Frame::new(
            MsgClass::BankCommand,
            BankSubtype::QueryAllBanks.as_u8(),
            0x00FE,
            0x0001,
            vec![],
        )
    }

    #[test]
    fn test_crc8_known_properties() {
        assert_eq!(crc8(&[]), 0x00);
        let a = crc8(b"123456789");
        let b = crc8(b"123456788");
        assert_ne!(a, b);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode_with_sequence(&bank_query(), 7);
        assert_eq!(bytes.len(), MsgClass::BankCommand.frame_len());
        assert_eq!(&bytes[..2], &MAGIC);
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(&bytes[4..6], &[0xFE, 0x00]);
        assert_eq!(&bytes[6..8], &[0x01, 0x00]);
        assert_eq!(bytes[bytes.len() - 2], 7);
        assert_eq!(bytes[bytes.len() - 1], crc8(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn test_payload_padded_and_truncated() {
        let short = Frame::new(MsgClass::InfoSlotAck, SLOT_SET, 1, 2, vec![1, 2]);
        assert_eq!(short.payload, vec![1, 2, 0, 0, 0, 0, 0, 0]);
        let long = Frame::new(MsgClass::InfoSlotAck, SLOT_SET, 1, 2, vec![9; 20]);
        assert_eq!(long.payload.len(), 8);
    }

    #[test]
    fn test_decode_single_frame() {
        let frame = bank_query();
        let bytes = encode_with_sequence(&frame, 3);
        let mut buffer = FrameBuffer::with_capacity(256);
        let frames = decode(&mut buffer, &bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key(), frame.key());
        assert_eq!(frames[0].sequence, 3);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_decode_waits_for_split_frame() {
        let bytes = encode_with_sequence(&bank_query(), 0);
        let mut buffer = FrameBuffer::with_capacity(256);
        assert!(decode(&mut buffer, &bytes[..5]).is_empty());
        assert_eq!(buffer.pending(), 5);
        let frames = decode(&mut buffer, &bytes[5..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_decode_skips_garbage_and_unknown_class() {
        let mut stream = vec![0x00, 0xEB, 0x90, 0x7F, 0x13];
        stream.extend(encode_with_sequence(&bank_query(), 1));
        let mut buffer = FrameBuffer::with_capacity(256);
        let frames = decode(&mut buffer, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 1);
    }

    #[test]
    fn test_decode_input_larger_than_buffer() {
        let mut stream = Vec::new();
        for seq in 0..40u8 {
            stream.extend(encode_with_sequence(&bank_query(), seq));
        }
        let mut buffer = FrameBuffer::with_capacity(0);
        assert_eq!(buffer.capacity(), MAX_FRAME_LEN);
        let frames = decode(&mut buffer, &stream);
        assert_eq!(frames.len(), 40);
        assert_eq!(frames[39].sequence, 39);
    }

    #[test]
    fn test_every_class_has_unique_id() {
        for class in MsgClass::ALL {
            assert_eq!(MsgClass::from_id(class.id()), Some(class));
            assert!(class.payload_len() <= MsgClass::MAX_PAYLOAD_LEN);
        }
    }
}
