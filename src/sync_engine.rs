//! Mission synchronization state machine.
//!
//! The engine reconciles the ground station's mission with the banks stored on
//! the vehicle. It performs no I/O: every method takes the current time and
//! returns [`SyncAction`]s for the caller to execute (send a frame, report
//! progress, deliver a result). One transaction runs at a time.
//!
//! ```text
//!          start_read            start_write          start_remove_all
//!   Idle ─────────────> Reading  ──────────> Writing  ───────────────> RemovingAll
//!    ^                     │                    │                          │
//!    └─────────────────────┴── success / abort ─┴──────────────────────────┘
//! ```
//!
//! Read: Query-All-Banks, Query-Single-Bank for every bank id, then
//! Query-Single-InfoSlot for every slot of every bank.
//!
//! Write: Query-All-Banks (capacity check), Query-Single-Bank for every target,
//! then per bank: Set-Single-InfoSlot for each slot, Refactor-InfoSlot, and
//! Set-Single-Bank.
//!
//! Remove-All: Query-All-Banks, then Set-Single-Bank with a cleared record for
//! every bank id.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::ack_manager::{AckKind, AckManager, RetryCause, TimeoutOutcome};
use crate::codec::{Frame, MsgClass, SLOT_SET};
use crate::config::SyncConfig;
use crate::contracts::{BankRecord, BankRequest, InfoSlot, Mission, MissionBank, StateFlags};
use crate::errors::{Result, SlotRef, SyncError};
use crate::receiver::Inbound;

/// Engine state; anything but `Idle` means a transaction is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Reading,
    Writing,
    RemovingAll,
    Commanding,
}

impl SyncState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reading => "read",
            Self::Writing => "write",
            Self::RemovingAll => "remove-all",
            Self::Commanding => "command",
        }
    }
}

/// Transaction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Read,
    Write,
    RemoveAll,
    Command,
}

/// Successful transaction result.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Read(Mission),
    Write,
    RemoveAll,
    Command,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Encode and send this frame to the vehicle
    SendFrame(Frame),
    /// Fraction of the active transaction completed
    Progress(f32),
    /// A transaction started or ended
    ActiveChanged(bool),
    /// The transaction ended
    Finished {
        kind: TransactionKind,
        result: Result<Completion>,
    },
}

/// Next request to issue.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Outbound {
    Bank(BankRequest),
    Slot(InfoSlot),
}

impl Outbound {
    fn ack(&self) -> AckKind {
        match self {
            Self::Slot(_) => AckKind::SlotWritten,
            Self::Bank(request) => match request {
                BankRequest::QueryAllBanks => AckKind::BankSummary,
                BankRequest::QuerySingleBank { .. } => AckKind::BankRecord,
                BankRequest::SetSingleBank(_) => AckKind::BankCommitted,
                BankRequest::RefactorInfoSlot { .. } => AckKind::BankChecksum,
                BankRequest::QuerySingleInfoSlot { .. } => AckKind::SlotReport,
                BankRequest::EnableBankAutoSwitch { .. } => AckKind::AutoSwitch,
                BankRequest::WaypointAutoSwitch { .. } => AckKind::WaypointSwitch,
            },
        }
    }

    fn action(&self) -> String {
        match self {
            Self::Slot(slot) => format!("upload bank {} slot {}", slot.bank_id, slot.slot_id),
            Self::Bank(request) => request.to_string(),
        }
    }

    fn to_frame(self, source_id: u16, target_id: u16) -> Frame {
        match self {
            Self::Slot(slot) => {
                Frame::new(MsgClass::InfoSlot, SLOT_SET, source_id, target_id, slot.encode())
            }
            Self::Bank(request) => Frame::new(
                MsgClass::BankCommand,
                request.subtype().as_u8(),
                source_id,
                target_id,
                request.encode_payload(),
            ),
        }
    }
}

/// What a transaction wants after an accepted acknowledgment.
enum Step {
    Next(Outbound),
    /// Response dropped; keep waiting for the right one
    Ignore(RetryCause),
    /// Resend the current request now
    Retry(RetryCause),
    Done(Completion),
    Fail(SyncError),
}

#[derive(Debug, Default)]
struct ReadTxn {
    bank_total: u16,
    bank_ids: VecDeque<u16>,
    banks: Vec<MissionBank>,
    /// (index into `banks`, slot ids still to download)
    slot_work: VecDeque<(usize, VecDeque<u16>)>,
}

impl ReadTxn {
    fn total_units(&self) -> usize {
        let slots: usize = self.banks.iter().map(|b| usize::from(b.record.info_slot_count)).sum();
        1 + usize::from(self.bank_total) + slots
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Step {
        match inbound {
            Inbound::BankSummary(summary) => {
                self.bank_total = summary.large_bank_count;
                self.bank_ids = (0..summary.large_bank_count).collect();
                self.next_bank()
            }
            Inbound::BankRecord(record) => {
                let Some(&expected) = self.bank_ids.front() else {
                    return Step::Fail(SyncError::Internal(
                        "bank record with no bank pending".into(),
                    ));
                };
                if record.bank_id != expected {
                    return Step::Ignore(RetryCause::RequestMismatch {
                        expected: SlotRef::bank(expected),
                        received: SlotRef::bank(record.bank_id),
                    });
                }
                self.bank_ids.pop_front();
                self.banks.push(MissionBank {
                    record,
                    slots: Vec::with_capacity(usize::from(record.info_slot_count)),
                });
                self.next_bank()
            }
            Inbound::SlotReport(slot) => {
                let Some((index, ids)) = self.slot_work.front_mut() else {
                    return Step::Fail(SyncError::Internal("info-slot with no slot pending".into()));
                };
                let bank = &mut self.banks[*index];
                let slot_id = ids.front().copied().unwrap_or_default();
                let expected = SlotRef::slot(bank.record.bank_id, slot_id);
                let received = SlotRef::slot(slot.bank_id, slot.slot_id);
                if expected != received {
                    return Step::Ignore(RetryCause::RequestMismatch { expected, received });
                }
                bank.slots.push(slot);
                ids.pop_front();
                if ids.is_empty() {
                    self.slot_work.pop_front();
                }
                self.next_slot()
            }
            other => Step::Fail(SyncError::Internal(format!("read cannot handle {other:?}"))),
        }
    }

    fn next_bank(&mut self) -> Step {
        if let Some(&bank_id) = self.bank_ids.front() {
            return Step::Next(Outbound::Bank(BankRequest::QuerySingleBank { bank_id }));
        }
        self.slot_work = self
            .banks
            .iter()
            .enumerate()
            .filter(|(_, bank)| bank.record.info_slot_count > 0)
            .map(|(index, bank)| (index, (0..bank.record.info_slot_count).collect()))
            .collect();
        self.next_slot()
    }

    fn next_slot(&mut self) -> Step {
        match self.slot_work.front() {
            Some((index, ids)) => Step::Next(Outbound::Bank(BankRequest::QuerySingleInfoSlot {
                bank_id: self.banks[*index].record.bank_id,
                slot_id: ids.front().copied().unwrap_or_default(),
            })),
            None => Step::Done(Completion::Read(Mission {
                banks: std::mem::take(&mut self.banks),
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Summary,
    Probe(usize),
    Upload { bank: usize, slot: usize },
    Refactor(usize),
    Commit(usize),
}

#[derive(Debug)]
struct WriteTxn {
    targets: Vec<MissionBank>,
    observed: Vec<BankRecord>,
    phase: WritePhase,
}

impl WriteTxn {
    fn total_units(&self) -> usize {
        let slots: usize = self.targets.iter().map(|b| b.slots.len()).sum();
        1 + 3 * self.targets.len() + slots
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Step {
        match (self.phase, inbound) {
            (WritePhase::Summary, Inbound::BankSummary(summary)) => {
                let available = usize::from(summary.large_bank_count);
                if available < self.targets.len() {
                    return Step::Fail(SyncError::InsufficientCapacity {
                        what: "banks",
                        required: self.targets.len(),
                        available,
                    });
                }
                let capacity = usize::from(summary.large_slot_capacity);
                if let Some(largest) = self.targets.iter().map(|b| b.slots.len()).max() {
                    if largest > capacity {
                        return Step::Fail(SyncError::InsufficientCapacity {
                            what: "info-slots per bank",
                            required: largest,
                            available: capacity,
                        });
                    }
                }
                self.probe(0)
            }
            (WritePhase::Probe(index), Inbound::BankRecord(record)) => {
                let expected = self.targets[index].record.bank_id;
                if record.bank_id != expected {
                    return Step::Ignore(RetryCause::RequestMismatch {
                        expected: SlotRef::bank(expected),
                        received: SlotRef::bank(record.bank_id),
                    });
                }
                // TODO: refuse to overwrite locked or occupied banks once the
                // intended policy for in-use banks is settled.
                if record.state_flags.is_locked() || record.state_flags.is_occupied() {
                    warn!(
                        bank_id = record.bank_id,
                        flags = record.state_flags.bits(),
                        "overwriting a locked or occupied bank"
                    );
                }
                self.observed.push(record);
                self.probe(index + 1)
            }
            (WritePhase::Upload { bank, slot }, Inbound::SlotWritten(ack)) => {
                let sent = self.targets[bank].slots[slot];
                let expected = SlotRef::slot(sent.bank_id, sent.slot_id);
                let received = SlotRef::slot(ack.bank_id, ack.slot_id);
                if expected != received {
                    return Step::Ignore(RetryCause::RequestMismatch { expected, received });
                }
                if ack.status != 0 {
                    return Step::Retry(RetryCause::SlotRejected {
                        slot: expected,
                        status: ack.status,
                    });
                }
                if ack.checksum != sent.checksum {
                    return Step::Retry(RetryCause::ChecksumMismatch {
                        slot: expected,
                        sent: sent.checksum,
                        echoed: ack.checksum,
                    });
                }
                if slot + 1 < self.targets[bank].slots.len() {
                    self.phase = WritePhase::Upload { bank, slot: slot + 1 };
                    Step::Next(Outbound::Slot(self.targets[bank].slots[slot + 1]))
                } else {
                    self.refactor(bank)
                }
            }
            (WritePhase::Refactor(bank), Inbound::BankChecksum(checksum)) => {
                let target = self.targets[bank].record;
                let verified = checksum.matches(&target);
                if !verified {
                    warn!(
                        bank_id = target.bank_id,
                        device_bank = checksum.bank_id,
                        device_slots = checksum.info_slot_count,
                        "refactor checksum does not match upload, committing unverified"
                    );
                }
                let locked = self.observed[bank].state_flags.is_locked();
                let flags = target
                    .state_flags
                    .with(StateFlags::LOADED, true)
                    .with(StateFlags::VERIFIED, verified)
                    .with(StateFlags::LOCKED, locked);
                self.phase = WritePhase::Commit(bank);
                Step::Next(Outbound::Bank(BankRequest::SetSingleBank(BankRecord {
                    state_flags: flags,
                    ..target
                })))
            }
            (WritePhase::Commit(bank), Inbound::BankCommitted(echo)) => {
                let expected = self.targets[bank].record.bank_id;
                if echo.bank_id != expected {
                    return Step::Ignore(RetryCause::RequestMismatch {
                        expected: SlotRef::bank(expected),
                        received: SlotRef::bank(echo.bank_id),
                    });
                }
                self.begin_bank(bank + 1)
            }
            (phase, other) => Step::Fail(SyncError::Internal(format!(
                "write in {phase:?} cannot handle {other:?}"
            ))),
        }
    }

    fn probe(&mut self, index: usize) -> Step {
        match self.targets.get(index) {
            Some(target) => {
                self.phase = WritePhase::Probe(index);
                Step::Next(Outbound::Bank(BankRequest::QuerySingleBank {
                    bank_id: target.record.bank_id,
                }))
            }
            None => self.begin_bank(0),
        }
    }

    fn begin_bank(&mut self, bank: usize) -> Step {
        let Some(target) = self.targets.get(bank) else {
            return Step::Done(Completion::Write);
        };
        match target.slots.first() {
            Some(first) => {
                self.phase = WritePhase::Upload { bank, slot: 0 };
                Step::Next(Outbound::Slot(*first))
            }
            None => self.refactor(bank),
        }
    }

    fn refactor(&mut self, bank: usize) -> Step {
        let record = self.targets[bank].record;
        self.phase = WritePhase::Refactor(bank);
        Step::Next(Outbound::Bank(BankRequest::RefactorInfoSlot {
            bank_id: record.bank_id,
            waypoint_count: record.waypoint_count,
            info_slot_count: record.info_slot_count,
        }))
    }
}

#[derive(Debug, Default)]
struct ClearTxn {
    bank_count: u16,
    next: u16,
}

impl ClearTxn {
    fn total_units(&self) -> usize {
        1 + usize::from(self.bank_count)
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Step {
        match inbound {
            Inbound::BankSummary(summary) => {
                self.bank_count = summary.large_bank_count;
                self.next = 0;
                self.clear_next()
            }
            Inbound::BankCommitted(echo) => {
                if echo.bank_id != self.next {
                    return Step::Ignore(RetryCause::RequestMismatch {
                        expected: SlotRef::bank(self.next),
                        received: SlotRef::bank(echo.bank_id),
                    });
                }
                self.next += 1;
                self.clear_next()
            }
            other => Step::Fail(SyncError::Internal(format!("remove-all cannot handle {other:?}"))),
        }
    }

    fn clear_next(&self) -> Step {
        if self.next >= self.bank_count {
            return Step::Done(Completion::RemoveAll);
        }
        Step::Next(Outbound::Bank(BankRequest::SetSingleBank(BankRecord {
            bank_id: self.next,
            ..Default::default()
        })))
    }
}

#[derive(Debug)]
enum Transaction {
    Read(ReadTxn),
    Write(WriteTxn),
    RemoveAll(ClearTxn),
    Command(BankRequest),
}

impl Transaction {
    fn kind(&self) -> TransactionKind {
        match self {
            Self::Read(_) => TransactionKind::Read,
            Self::Write(_) => TransactionKind::Write,
            Self::RemoveAll(_) => TransactionKind::RemoveAll,
            Self::Command(_) => TransactionKind::Command,
        }
    }

    fn state(&self) -> SyncState {
        match self {
            Self::Read(_) => SyncState::Reading,
            Self::Write(_) => SyncState::Writing,
            Self::RemoveAll(_) => SyncState::RemovingAll,
            Self::Command(_) => SyncState::Commanding,
        }
    }

    fn total_units(&self) -> usize {
        match self {
            Self::Read(txn) => txn.total_units(),
            Self::Write(txn) => txn.total_units(),
            Self::RemoveAll(txn) => txn.total_units(),
            Self::Command(_) => 1,
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Step {
        match self {
            Self::Read(txn) => txn.on_inbound(inbound),
            Self::Write(txn) => txn.on_inbound(inbound),
            Self::RemoveAll(txn) => txn.on_inbound(inbound),
            Self::Command(request) => command_step(request, inbound),
        }
    }
}

fn command_step(request: &BankRequest, inbound: Inbound) -> Step {
    let (expected, echo) = match (request, inbound) {
        (BankRequest::EnableBankAutoSwitch { bank_id, .. }, Inbound::AutoSwitch(echo))
        | (BankRequest::WaypointAutoSwitch { bank_id, .. }, Inbound::WaypointSwitch(echo)) => {
            (*bank_id, echo)
        }
        (_, other) => {
            return Step::Fail(SyncError::Internal(format!(
                "command cannot handle {other:?}"
            )))
        }
    };
    if echo.bank_id != expected {
        return Step::Ignore(RetryCause::RequestMismatch {
            expected: SlotRef::bank(expected),
            received: SlotRef::bank(echo.bank_id),
        });
    }
    Step::Done(Completion::Command)
}

/// Synchronization engine for one vehicle.
#[derive(Debug)]
pub struct SyncEngine {
    ground_id: u16,
    vehicle_id: u16,
    acks: AckManager,
    txn: Option<Transaction>,
    completed_units: usize,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            ground_id: config.ground_id,
            vehicle_id: config.vehicle_id,
            acks: AckManager::new(config.ack_timeout(), config.max_retries),
            txn: None,
            completed_units: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.txn.as_ref().map_or(SyncState::Idle, Transaction::state)
    }

    pub fn is_active(&self) -> bool {
        self.txn.is_some()
    }

    /// Completed fraction of the active transaction, 0.0 when idle.
    pub fn progress(&self) -> f32 {
        match &self.txn {
            Some(txn) => {
                let total = txn.total_units().max(1);
                (self.completed_units.min(total) as f32) / (total as f32)
            }
            None => 0.0,
        }
    }

    /// When [`SyncEngine::handle_timeout`] should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.acks.deadline()
    }

    /// Name of the request currently awaiting acknowledgment.
    pub fn pending_action(&self) -> Option<&str> {
        self.acks.pending().map(|pending| pending.action.as_str())
    }

    pub fn retry_count(&self) -> u32 {
        self.acks.retry_count()
    }

    /// Download every bank and info-slot from the vehicle.
    pub fn start_read(&mut self, now: Instant) -> Result<Vec<SyncAction>> {
        self.begin(
            Transaction::Read(ReadTxn::default()),
            Outbound::Bank(BankRequest::QueryAllBanks),
            now,
        )
    }

    /// Upload `mission` to the vehicle, bank by bank.
    pub fn start_write(&mut self, mission: Mission, now: Instant) -> Result<Vec<SyncAction>> {
        let targets = mission
            .banks
            .into_iter()
            .map(|bank| MissionBank::new(bank.record, bank.slots))
            .collect::<Result<Vec<_>>>()?;
        let txn = WriteTxn {
            targets,
            observed: Vec::new(),
            phase: WritePhase::Summary,
        };
        self.begin(Transaction::Write(txn), Outbound::Bank(BankRequest::QueryAllBanks), now)
    }

    /// Clear every bank on the vehicle.
    pub fn start_remove_all(&mut self, now: Instant) -> Result<Vec<SyncAction>> {
        self.begin(
            Transaction::RemoveAll(ClearTxn::default()),
            Outbound::Bank(BankRequest::QueryAllBanks),
            now,
        )
    }

    /// Issue a single auto-switch command and wait for its acknowledgment.
    pub fn start_command(&mut self, request: BankRequest, now: Instant) -> Result<Vec<SyncAction>> {
        match request {
            BankRequest::EnableBankAutoSwitch { .. } | BankRequest::WaypointAutoSwitch { .. } => {
                self.begin(Transaction::Command(request), Outbound::Bank(request), now)
            }
            other => Err(SyncError::Internal(format!("{other} is not a standalone command"))),
        }
    }

    fn begin(
        &mut self,
        txn: Transaction,
        first: Outbound,
        now: Instant,
    ) -> Result<Vec<SyncAction>> {
        if let Some(active) = &self.txn {
            return Err(SyncError::TransactionActive {
                active: active.state().name(),
            });
        }
        info!(transaction = txn.state().name(), "transaction started");
        self.txn = Some(txn);
        self.completed_units = 0;
        self.acks.reset();

        let mut actions = vec![SyncAction::ActiveChanged(true), SyncAction::Progress(0.0)];
        actions.push(self.issue(first, now));
        Ok(actions)
    }

    fn issue(&mut self, outbound: Outbound, now: Instant) -> SyncAction {
        let frame = outbound.to_frame(self.ground_id, self.vehicle_id);
        let action = outbound.action();
        debug!(action = %action, "sending request");
        self.acks.arm(outbound.ack(), frame.clone(), action, now);
        SyncAction::SendFrame(frame)
    }

    /// Feed a routed inbound message.
    pub fn handle_inbound(&mut self, inbound: Inbound, now: Instant) -> Vec<SyncAction> {
        if self.txn.is_none() {
            debug!(?inbound, "no transaction active, ignoring");
            return Vec::new();
        }

        if let Inbound::DeviceError(report) = inbound {
            return self.abort(SyncError::DeviceRejected(report));
        }

        let Some(kind) = inbound.ack_kind() else {
            return Vec::new();
        };
        if self.acks.expected() != Some(kind) {
            debug!(?kind, expected = ?self.acks.expected(), "stale acknowledgment, ignoring");
            return Vec::new();
        }

        let step = match self.txn.as_mut() {
            Some(txn) => txn.on_inbound(inbound),
            None => return Vec::new(),
        };
        self.apply(step, kind, now)
    }

    fn apply(&mut self, step: Step, kind: AckKind, now: Instant) -> Vec<SyncAction> {
        match step {
            Step::Next(outbound) => {
                self.acks.on_frame_received(kind);
                self.completed_units += 1;
                let progress = self.progress();
                vec![SyncAction::Progress(progress), self.issue(outbound, now)]
            }
            Step::Ignore(cause) => {
                warn!(
                    ?cause,
                    action = ?self.pending_action(),
                    "response does not match request, dropped"
                );
                self.acks.note_mismatch(cause);
                Vec::new()
            }
            Step::Retry(cause) => {
                warn!(?cause, "acknowledgment rejected, resending");
                let outcome = self.acks.retry_now(cause, now);
                self.on_outcome(outcome)
            }
            Step::Done(completion) => {
                self.acks.on_frame_received(kind);
                self.completed_units += 1;
                self.finish(Ok(completion))
            }
            Step::Fail(error) => self.abort(error),
        }
    }

    /// Fire the ack timer if it is due.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<SyncAction> {
        if self.txn.is_none() {
            return Vec::new();
        }
        let outcome = self.acks.poll(now);
        self.on_outcome(outcome)
    }

    fn on_outcome(&mut self, outcome: TimeoutOutcome) -> Vec<SyncAction> {
        match outcome {
            TimeoutOutcome::Idle => Vec::new(),
            TimeoutOutcome::Retry(frame) => vec![SyncAction::SendFrame(frame)],
            TimeoutOutcome::Exhausted(error) => self.abort(error),
        }
    }

    /// Abort the active transaction, if any, with `error`.
    pub fn abort(&mut self, error: SyncError) -> Vec<SyncAction> {
        if self.txn.is_none() {
            return Vec::new();
        }
        error!(code = error.code(), %error, "transaction aborted");
        self.finish(Err(error))
    }

    fn finish(&mut self, result: Result<Completion>) -> Vec<SyncAction> {
        let Some(txn) = self.txn.take() else {
            return Vec::new();
        };
        let kind = txn.kind();
        self.acks.reset();
        self.completed_units = 0;

        let mut actions = Vec::with_capacity(3);
        if result.is_ok() {
            info!(transaction = txn.state().name(), "transaction complete");
            actions.push(SyncAction::Progress(1.0));
        }
        actions.push(SyncAction::ActiveChanged(false));
        actions.push(SyncAction::Finished { kind, result });
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BankSubtype;
    use crate::contracts::{BankChecksum, BankSummary, CommandEcho, SlotAck};
    use std::time::Duration;

    fn engine() -> SyncEngine {
        SyncEngine::new(&SyncConfig::default())
    }

    fn sent_subtypes(actions: &[SyncAction]) -> Vec<u8> {
        actions
            .iter()
            .filter_map(|action| match action {
                SyncAction::SendFrame(frame) => Some(frame.subtype),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_second_transaction_rejected() {
        let now = Instant::now();
        let mut engine = engine();
        engine.start_read(now).unwrap();
        let err = engine.start_remove_all(now).unwrap_err();
        assert_eq!(err, SyncError::TransactionActive { active: "read" });
        assert_eq!(engine.state(), SyncState::Reading);
    }

    #[test]
    fn test_start_read_sends_query_all() {
        let mut engine = engine();
        let actions = engine.start_read(Instant::now()).unwrap();
        assert_eq!(actions[0], SyncAction::ActiveChanged(true));
        assert_eq!(sent_subtypes(&actions), vec![BankSubtype::QueryAllBanks.as_u8()]);
    }

    #[test]
    fn test_read_with_no_banks_completes() {
        let now = Instant::now();
        let mut engine = engine();
        engine.start_read(now).unwrap();
        let actions = engine.handle_inbound(Inbound::BankSummary(BankSummary::default()), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Read,
            result: Ok(Completion::Read(Mission::default())),
        }));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_stale_ack_ignored() {
        let now = Instant::now();
        let mut engine = engine();
        engine.start_read(now).unwrap();
        let actions = engine.handle_inbound(Inbound::BankRecord(BankRecord::default()), now);
        assert!(actions.is_empty());
        assert_eq!(engine.state(), SyncState::Reading);
    }

    #[test]
    fn test_read_drops_wrong_bank() {
        let now = Instant::now();
        let mut engine = engine();
        engine.start_read(now).unwrap();
        let summary = BankSummary {
            large_bank_count: 2,
            ..Default::default()
        };
        engine.handle_inbound(Inbound::BankSummary(summary), now);
        let wrong = BankRecord {
            bank_id: 1,
            ..Default::default()
        };
        assert!(engine.handle_inbound(Inbound::BankRecord(wrong), now).is_empty());
        assert_eq!(engine.pending_action(), Some("query bank 0"));
    }

    #[test]
    fn test_write_insufficient_capacity() {
        let now = Instant::now();
        let mut engine = engine();
        let mission = Mission::from_parts(
            vec![BankRecord::default(), BankRecord { bank_id: 1, ..Default::default() }],
            vec![],
        )
        .unwrap();
        engine.start_write(mission, now).unwrap();
        let summary = BankSummary {
            large_bank_count: 1,
            large_slot_capacity: 10,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::BankSummary(summary), now);
        assert!(actions.iter().any(|a| matches!(
            a,
            SyncAction::Finished {
                kind: TransactionKind::Write,
                result: Err(SyncError::InsufficientCapacity {
                    what: "banks",
                    required: 2,
                    available: 1,
                }),
            }
        )));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_write_rejects_oversized_bank_before_sending() {
        let mut engine = engine();
        let mission = Mission {
            banks: vec![MissionBank {
                record: BankRecord::default(),
                slots: vec![InfoSlot::default(); 65_536],
            }],
        };
        let result = engine.start_write(mission, Instant::now());
        assert!(matches!(
            result,
            Err(SyncError::InsufficientCapacity {
                what: "info-slots per bank",
                required: 65_536,
                ..
            })
        ));
        assert!(!engine.is_active());
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn test_write_checksum_mismatch_resends_same_slot() {
        let now = Instant::now();
        let mut engine = engine();
        let slot = InfoSlot {
            slot_id: 0,
            altitude: 50.0,
            ..Default::default()
        };
        let mission = Mission::from_parts(vec![BankRecord::default()], vec![vec![slot]]).unwrap();
        let sealed = mission.banks[0].slots[0];
        engine.start_write(mission, now).unwrap();
        engine.handle_inbound(
            Inbound::BankSummary(BankSummary {
                large_bank_count: 1,
                large_slot_capacity: 8,
                ..Default::default()
            }),
            now,
        );
        let actions = engine.handle_inbound(Inbound::BankRecord(BankRecord::default()), now);
        assert_eq!(sent_subtypes(&actions), vec![SLOT_SET]);

        let bad = SlotAck {
            checksum: sealed.checksum.wrapping_add(1),
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::SlotWritten(bad), now);
        assert_eq!(sent_subtypes(&actions), vec![SLOT_SET]);
        assert_eq!(engine.retry_count(), 1);

        let good = SlotAck {
            checksum: sealed.checksum,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::SlotWritten(good), now);
        assert_eq!(sent_subtypes(&actions), vec![BankSubtype::RefactorInfoSlot.as_u8()]);
    }

    /// Start a write of `mission` and answer the summary and every bank query, so
    /// the engine is about to upload the first slot.
    fn write_until_upload(engine: &mut SyncEngine, mission: Mission, now: Instant) {
        let banks: Vec<u16> = mission.banks.iter().map(|b| b.record.bank_id).collect();
        engine.start_write(mission, now).unwrap();
        let summary = BankSummary {
            large_bank_count: 4,
            large_slot_capacity: 8,
            ..Default::default()
        };
        engine.handle_inbound(Inbound::BankSummary(summary), now);
        for bank_id in banks {
            let probed = BankRecord {
                bank_id,
                ..Default::default()
            };
            engine.handle_inbound(Inbound::BankRecord(probed), now);
        }
    }

    fn commit_record(actions: &[SyncAction]) -> BankRecord {
        actions
            .iter()
            .find_map(|action| match action {
                SyncAction::SendFrame(frame) if frame.class == MsgClass::BankCommand => {
                    BankRecord::decode(&frame.payload).ok()
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_write_unverified_checksum_commits_and_continues() {
        let now = Instant::now();
        let mut engine = engine();
        let second = BankRecord {
            bank_id: 1,
            ..Default::default()
        };
        let slot = InfoSlot {
            altitude: 30.0,
            ..Default::default()
        };
        let mission =
            Mission::from_parts(vec![BankRecord::default(), second], vec![vec![slot]]).unwrap();
        let target = mission.banks[0].record;
        let sealed = mission.banks[0].slots[0];
        write_until_upload(&mut engine, mission, now);

        let ack = SlotAck {
            checksum: sealed.checksum,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::SlotWritten(ack), now);
        assert_eq!(sent_subtypes(&actions), vec![BankSubtype::RefactorInfoSlot.as_u8()]);

        let miscounted = BankChecksum {
            bank_id: target.bank_id,
            waypoint_count: target.waypoint_count,
            info_slot_count: target.info_slot_count + 1,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::BankChecksum(miscounted), now);
        let committed = commit_record(&actions);
        assert!(!committed.state_flags.is_verified());
        assert!(committed.state_flags.contains(StateFlags::LOADED));
        assert!(engine.is_active());

        let echo = CommandEcho::default();
        let actions = engine.handle_inbound(Inbound::BankCommitted(echo), now);
        assert_eq!(sent_subtypes(&actions), vec![BankSubtype::RefactorInfoSlot.as_u8()]);

        let matching = BankChecksum {
            bank_id: 1,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::BankChecksum(matching), now);
        assert!(commit_record(&actions).state_flags.is_verified());

        let echo = CommandEcho {
            bank_id: 1,
            ..Default::default()
        };
        let actions = engine.handle_inbound(Inbound::BankCommitted(echo), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Write,
            result: Ok(Completion::Write),
        }));
    }

    #[test]
    fn test_write_rejected_slot_status_retries_then_aborts() {
        let now = Instant::now();
        let mut engine = engine();
        let mission =
            Mission::from_parts(vec![BankRecord::default()], vec![vec![InfoSlot::default()]])
                .unwrap();
        let sealed = mission.banks[0].slots[0];
        write_until_upload(&mut engine, mission, now);

        let rejected = SlotAck {
            checksum: sealed.checksum,
            status: 1,
            ..Default::default()
        };
        for attempt in 1..=crate::MAX_RETRIES {
            let actions = engine.handle_inbound(Inbound::SlotWritten(rejected), now);
            assert_eq!(sent_subtypes(&actions), vec![SLOT_SET]);
            assert_eq!(engine.retry_count(), attempt);
        }

        let actions = engine.handle_inbound(Inbound::SlotWritten(rejected), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Write,
            result: Err(SyncError::SlotRejected {
                slot: SlotRef::slot(0, 0),
                status: 1,
            }),
        }));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_write_commit_preserves_lock_and_sets_verified() {
        let now = Instant::now();
        let mut engine = engine();
        let record = BankRecord {
            successor_bank_id: 3,
            ..Default::default()
        };
        let mission = Mission::from_parts(vec![record], vec![]).unwrap();
        engine.start_write(mission, now).unwrap();
        engine.handle_inbound(
            Inbound::BankSummary(BankSummary {
                large_bank_count: 1,
                ..Default::default()
            }),
            now,
        );
        let locked = BankRecord {
            state_flags: StateFlags::from_bits(StateFlags::LOCKED),
            ..Default::default()
        };
        engine.handle_inbound(Inbound::BankRecord(locked), now);
        let actions = engine.handle_inbound(Inbound::BankChecksum(BankChecksum::default()), now);
        let commit = actions
            .iter()
            .find_map(|a| match a {
                SyncAction::SendFrame(frame) => Some(frame.clone()),
                _ => None,
            })
            .unwrap();
        let record = BankRecord::decode(&commit.payload).unwrap();
        assert!(record.state_flags.is_locked());
        assert!(record.state_flags.is_verified());
        assert_eq!(record.successor_bank_id, 3);

        let actions = engine.handle_inbound(Inbound::BankCommitted(CommandEcho::default()), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Write,
            result: Ok(Completion::Write),
        }));
    }

    #[test]
    fn test_timeout_retries_then_aborts() {
        let start = Instant::now();
        let mut engine = engine();
        engine.start_remove_all(start).unwrap();
        let step = Duration::from_millis(crate::ACK_TIMEOUT_MS);
        let mut now = start;
        for _ in 0..crate::MAX_RETRIES {
            now += step;
            let actions = engine.handle_timeout(now);
            assert_eq!(sent_subtypes(&actions), vec![BankSubtype::QueryAllBanks.as_u8()]);
        }
        now += step;
        let actions = engine.handle_timeout(now);
        assert!(actions.iter().any(|a| matches!(
            a,
            SyncAction::Finished {
                result: Err(SyncError::MaxRetryExceeded { .. }),
                ..
            }
        )));
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[test]
    fn test_device_error_aborts() {
        let now = Instant::now();
        let mut engine = engine();
        engine.start_read(now).unwrap();
        let report = crate::contracts::ErrorReport {
            failing_subtype: 1,
            diagnostic: crate::contracts::Diagnostic::InvalidCommand,
        };
        let actions = engine.handle_inbound(Inbound::DeviceError(report), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Read,
            result: Err(SyncError::DeviceRejected(report)),
        }));
    }

    #[test]
    fn test_command_rejects_non_command_request() {
        let mut engine = engine();
        let result = engine.start_command(BankRequest::QueryAllBanks, Instant::now());
        assert!(matches!(result, Err(SyncError::Internal(_))));
        assert!(!engine.is_active());
    }

    #[test]
    fn test_auto_switch_command() {
        let now = Instant::now();
        let mut engine = engine();
        let request = BankRequest::EnableBankAutoSwitch { bank_id: 2, enable: true };
        engine.start_command(request, now).unwrap();
        assert_eq!(engine.state(), SyncState::Commanding);
        let echo = CommandEcho {
            bank_id: 2,
            value: 1,
            status: 0,
        };
        let actions = engine.handle_inbound(Inbound::AutoSwitch(echo), now);
        assert!(actions.contains(&SyncAction::Finished {
            kind: TransactionKind::Command,
            result: Ok(Completion::Command),
        }));
    }
}
