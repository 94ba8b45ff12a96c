//! ACK Manager - single outstanding request with timeout and bounded retry.
//!
//! At most one request waits for an acknowledgment at a time. Arming a new
//! expectation replaces the previous one. A timer firing re-issues the exact
//! same request until the retry budget is spent, after which the enclosing
//! transaction must abort.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::codec::Frame;
use crate::errors::{SlotRef, SyncError};

/// Acknowledgment kinds the sync engine waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    BankSummary,
    BankRecord,
    BankCommitted,
    BankChecksum,
    SlotReport,
    SlotWritten,
    AutoSwitch,
    WaypointSwitch,
}

/// Why the last attempt of a request did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// Nothing matching arrived
    Timeout,
    /// The device echoed a different checksum for an uploaded slot
    ChecksumMismatch { slot: SlotRef, sent: u8, echoed: u8 },
    /// The device answered about a different bank/slot
    RequestMismatch { expected: SlotRef, received: SlotRef },
    /// The device acknowledged an uploaded slot with a non-zero status
    SlotRejected { slot: SlotRef, status: u8 },
}

/// The one request currently waiting for an acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub ack: AckKind,
    pub frame: Frame,
    /// Human-readable name used in logs and error messages
    pub action: String,
    pub deadline: Instant,
}

/// Result of a timer firing.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// Nothing was due
    Idle,
    /// Send this frame again
    Retry(Frame),
    /// Retry budget spent; abort the transaction with this error
    Exhausted(SyncError),
}

/// ACK Manager - tracks the outstanding expectation and its retry budget.
#[derive(Debug, Clone)]
pub struct AckManager {
    pending: Option<PendingRequest>,
    last_request: Option<Frame>,
    retry_count: u32,
    max_retries: u32,
    interval: Duration,
    cause: RetryCause,
}

impl AckManager {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            pending: None,
            last_request: None,
            retry_count: 0,
            max_retries,
            interval,
            cause: RetryCause::Timeout,
        }
    }

    /// Expect `ack` in answer to `frame`.
    ///
    /// The retry counter restarts only when `frame` differs from the last
    /// request issued.
    pub fn arm(&mut self, ack: AckKind, frame: Frame, action: String, now: Instant) {
        if self.last_request.as_ref() != Some(&frame) {
            self.retry_count = 0;
            self.cause = RetryCause::Timeout;
            self.last_request = Some(frame.clone());
        }
        self.pending = Some(PendingRequest {
            ack,
            frame,
            action,
            deadline: now + self.interval,
        });
    }

    pub fn expected(&self) -> Option<AckKind> {
        self.pending.as_ref().map(|pending| pending.ack)
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Clear the expectation if `ack` is what we wait for.
    pub fn on_frame_received(&mut self, ack: AckKind) -> bool {
        if self.expected() == Some(ack) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Remember why a response was dropped; reported if the budget runs out.
    pub fn note_mismatch(&mut self, cause: RetryCause) {
        self.cause = cause;
    }

    /// Fire the timer if the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> TimeoutOutcome {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.on_timeout(now),
            _ => TimeoutOutcome::Idle,
        }
    }

    /// Timer fired: re-issue the last request or give up.
    pub fn on_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        if self.pending.is_none() {
            return TimeoutOutcome::Idle;
        }

        if self.retry_count >= self.max_retries {
            let action = self
                .pending
                .take()
                .map(|pending| pending.action)
                .unwrap_or_default();
            let attempts = self.retry_count + 1;
            let cause = self.cause;
            self.reset();
            return TimeoutOutcome::Exhausted(exhaustion_error(action, attempts, cause));
        }

        self.retry_count += 1;
        let retry = self.retry_count;
        let interval = self.interval;
        match self.pending.as_mut() {
            Some(pending) => {
                pending.deadline = now + interval;
                warn!(action = %pending.action, retry, "no acknowledgment, retrying");
                TimeoutOutcome::Retry(pending.frame.clone())
            }
            None => TimeoutOutcome::Idle,
        }
    }

    /// Retry immediately, charging the retry budget like a timeout would.
    pub fn retry_now(&mut self, cause: RetryCause, now: Instant) -> TimeoutOutcome {
        self.cause = cause;
        self.on_timeout(now)
    }

    /// Drop the expectation and forget the retry history.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_request = None;
        self.retry_count = 0;
        self.cause = RetryCause::Timeout;
    }
}

fn exhaustion_error(action: String, attempts: u32, cause: RetryCause) -> SyncError {
    match cause {
        RetryCause::Timeout => SyncError::MaxRetryExceeded { action, attempts },
        RetryCause::ChecksumMismatch { slot, sent, echoed } => {
            SyncError::ChecksumMismatch { slot, sent, echoed }
        }
        RetryCause::RequestMismatch { expected, received } => SyncError::RequestMismatch {
            action,
            expected,
            received,
        },
        RetryCause::SlotRejected { slot, status } => SyncError::SlotRejected { slot, status },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgClass;

    fn request(subtype: u8) -> Frame {
        Frame::new(MsgClass::BankCommand, subtype, 1, 2, vec![])
    }

    #[test]
    fn test_retry_bound() {
        let now = Instant::now();
        let mut acks = AckManager::new(Duration::from_millis(100), 5);
        acks.arm(AckKind::BankSummary, request(1), "query all banks".into(), now);

        for expected in 1..=5 {
            assert!(matches!(acks.on_timeout(now), TimeoutOutcome::Retry(_)));
            assert_eq!(acks.retry_count(), expected);
        }
        match acks.on_timeout(now) {
            TimeoutOutcome::Exhausted(SyncError::MaxRetryExceeded { action, attempts }) => {
                assert_eq!(action, "query all banks");
                assert_eq!(attempts, 6);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(acks.expected(), None);
    }

    #[test]
    fn test_matching_ack_cancels() {
        let now = Instant::now();
        let mut acks = AckManager::new(Duration::from_millis(100), 5);
        acks.arm(AckKind::BankRecord, request(2), "query bank 0".into(), now);
        assert!(!acks.on_frame_received(AckKind::BankSummary));
        assert!(acks.on_frame_received(AckKind::BankRecord));
        assert_eq!(acks.poll(now + Duration::from_secs(1)), TimeoutOutcome::Idle);
    }

    #[test]
    fn test_poll_respects_deadline() {
        let now = Instant::now();
        let mut acks = AckManager::new(Duration::from_millis(100), 5);
        acks.arm(AckKind::BankRecord, request(2), "query bank 0".into(), now);
        assert_eq!(acks.poll(now + Duration::from_millis(99)), TimeoutOutcome::Idle);
        assert!(matches!(
            acks.poll(now + Duration::from_millis(100)),
            TimeoutOutcome::Retry(_)
        ));
        assert_eq!(acks.deadline(), Some(now + Duration::from_millis(200)));
    }

    #[test]
    fn test_counter_resets_only_for_new_action() {
        let now = Instant::now();
        let mut acks = AckManager::new(Duration::from_millis(100), 5);
        acks.arm(AckKind::SlotWritten, request(1), "upload".into(), now);
        acks.on_timeout(now);
        acks.on_timeout(now);
        acks.arm(AckKind::SlotWritten, request(1), "upload".into(), now);
        assert_eq!(acks.retry_count(), 2);
        acks.arm(AckKind::BankChecksum, request(4), "refactor".into(), now);
        assert_eq!(acks.retry_count(), 0);
    }

    #[test]
    fn test_checksum_cause_reported() {
        let now = Instant::now();
        let mut acks = AckManager::new(Duration::from_millis(100), 0);
        acks.arm(AckKind::SlotWritten, request(1), "upload".into(), now);
        let slot = SlotRef::slot(0, 3);
        let cause = RetryCause::ChecksumMismatch {
            slot,
            sent: 1,
            echoed: 2,
        };
        let outcome = acks.retry_now(cause, now);
        assert_eq!(
            outcome,
            TimeoutOutcome::Exhausted(SyncError::ChecksumMismatch { slot, sent: 1, echoed: 2 })
        );
    }
}
