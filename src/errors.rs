//! Error types for mission synchronization.
//!
//! Every failure that aborts a transaction is a [`SyncError`]. Payload layout
//! problems found while parsing a frame are [`CodecError`]s; they never abort
//! a transaction on their own, the offending frame is dropped instead.

use std::time::Duration;

use thiserror::Error;

use crate::contracts::ErrorReport;

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Identifies a bank, or one info-slot within it, on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub bank_id: u16,
    pub slot_id: Option<u16>,
}

impl SlotRef {
    pub fn bank(bank_id: u16) -> Self {
        Self {
            bank_id,
            slot_id: None,
        }
    }

    pub fn slot(bank_id: u16, slot_id: u16) -> Self {
        Self {
            bank_id,
            slot_id: Some(slot_id),
        }
    }
}

impl std::fmt::Display for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot_id {
            Some(slot_id) => write!(f, "bank {} slot {}", self.bank_id, slot_id),
            None => write!(f, "bank {}", self.bank_id),
        }
    }
}

/// Transaction-aborting failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Protocol invariant violated on our side
    #[error("internal protocol error: {0}")]
    Internal(String),

    /// Nothing acknowledged the transaction within the watchdog window
    #[error("no acknowledgment for {action} within {waited:?}")]
    AckTimeout { action: String, waited: Duration },

    /// The device answered about a different bank/slot than requested
    #[error("{action}: device answered for {received}, requested {expected}")]
    RequestMismatch {
        action: String,
        expected: SlotRef,
        received: SlotRef,
    },

    /// Uploaded info-slot echoed back with a different checksum
    #[error("checksum mismatch on {slot}: sent {sent:#04x}, device echoed {echoed:#04x}")]
    ChecksumMismatch { slot: SlotRef, sent: u8, echoed: u8 },

    /// Retry budget exhausted for the same request
    #[error("{action} failed after {attempts} attempts")]
    MaxRetryExceeded { action: String, attempts: u32 },

    /// Write target does not fit on the device
    #[error("insufficient device capacity: {what} needs {required}, device offers {available}")]
    InsufficientCapacity {
        what: &'static str,
        required: usize,
        available: usize,
    },

    /// A transaction is already in flight on this vehicle
    #[error("another transaction ({active}) is already active")]
    TransactionActive { active: &'static str },

    /// The device kept refusing an uploaded info-slot
    #[error("device refused {slot}: status {status:#04x}")]
    SlotRejected { slot: SlotRef, status: u8 },

    /// The device reported an error for one of our requests
    #[error("device rejected request: {0}")]
    DeviceRejected(ErrorReport),

    /// The link driver or transport is gone
    #[error("vehicle link closed")]
    LinkClosed,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Stable numeric code per failure class.
    pub fn code(&self) -> u16 {
        match self {
            Self::Internal(_) => 1,
            Self::AckTimeout { .. } => 2,
            Self::RequestMismatch { .. } => 3,
            Self::ChecksumMismatch { .. } => 4,
            Self::MaxRetryExceeded { .. } => 5,
            Self::InsufficientCapacity { .. } => 6,
            Self::TransactionActive { .. } => 7,
            Self::DeviceRejected(_) => 8,
            Self::LinkClosed => 9,
            Self::Config(_) => 10,
            Self::SlotRejected { .. } => 11,
        }
    }

    /// One human-readable sentence for the operator.
    pub fn user_message(&self) -> String {
        match self {
            Self::Internal(detail) => format!("Internal protocol error: {detail}."),
            Self::AckTimeout { action, .. } => {
                format!("The vehicle did not respond to {action}.")
            }
            Self::RequestMismatch {
                action, expected, ..
            } => format!(
                "The vehicle kept answering {action} for the wrong slot ({expected} requested)."
            ),
            Self::ChecksumMismatch { slot, .. } => {
                format!("Uploading {slot} failed: the vehicle stored a corrupted copy.")
            }
            Self::MaxRetryExceeded { action, attempts } => {
                format!("{action} failed after {attempts} attempts.")
            }
            Self::InsufficientCapacity {
                what,
                required,
                available,
            } => format!(
                "The mission does not fit on the vehicle: {required} {what} requested, {available} available."
            ),
            Self::TransactionActive { active } => {
                format!("Mission {active} is still in progress.")
            }
            Self::SlotRejected { slot, status } => {
                format!("The vehicle refused to store {slot} (status {status:#04x}).")
            }
            Self::DeviceRejected(report) => format!("The vehicle rejected the request: {report}."),
            Self::LinkClosed => "The vehicle link is closed.".to_string(),
            Self::Config(err) => format!("Invalid configuration: {err}."),
        }
    }
}

/// Payload layout failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated payload: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unexpected frame kind: class {class:#04x} subtype {subtype:#04x}")]
    UnexpectedKind { class: u8, subtype: u8 },
}

/// Configuration loading and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("cannot parse configuration: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_names_action() {
        let err = SyncError::MaxRetryExceeded {
            action: "query single bank 3".to_string(),
            attempts: 6,
        };
        let msg = err.user_message();
        assert!(msg.contains("query single bank 3"));
        assert!(msg.contains('6'));
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn test_checksum_display() {
        let err = SyncError::ChecksumMismatch {
            slot: SlotRef::slot(1, 4),
            sent: 0x12,
            echoed: 0x34,
        };
        let msg = err.to_string();
        assert!(msg.contains("bank 1 slot 4"));
        assert!(msg.contains("0x12"));
    }

    #[test]
    fn test_slot_rejected_message() {
        let err = SyncError::SlotRejected {
            slot: SlotRef::slot(0, 2),
            status: 1,
        };
        assert_eq!(err.code(), 11);
        assert!(err.user_message().contains("bank 0 slot 2"));
    }
}
