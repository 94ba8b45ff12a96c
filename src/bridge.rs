//! Vehicle bridge: the seam between a byte transport and the sync engine.
//!
//! A [`VehicleBridge`] owns everything that belongs to one vehicle connection
//! (channel state, engine, settings). Feed it transport bytes and timer ticks,
//! write out [`SessionOutput::outbound`], and hand [`SessionOutput::events`]
//! to whatever owns the mission model.

use std::time::Instant;

use tracing::{trace, warn};

use crate::channel::{ChannelState, LinkStats};
use crate::codec::{self, Frame};
use crate::config::SyncConfig;
use crate::contracts::{BankRequest, Mission};
use crate::errors::{Result, SyncError};
use crate::receiver::Receiver;
use crate::sync_engine::{Completion, SyncAction, SyncEngine, SyncState, TransactionKind};

/// Something the mission owner should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Progress(f32),
    ActiveChanged(bool),
    Finished {
        kind: TransactionKind,
        result: Result<Completion>,
    },
    LinkStats(LinkStats),
    /// A valid frame the engine does not consume (telemetry, other domains)
    Passthrough(Frame),
}

/// Receiver of bridge events, typically the mission editor.
pub trait MissionSink {
    fn on_progress(&mut self, progress: f32);

    fn on_active_changed(&mut self, active: bool);

    fn on_finished(&mut self, kind: TransactionKind, result: Result<Completion>);

    fn on_link_stats(&mut self, _stats: LinkStats) {}

    fn on_passthrough(&mut self, _frame: Frame) {}
}

/// Bytes to write and events to deliver, in order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionOutput {
    pub outbound: Vec<Vec<u8>>,
    pub events: Vec<SyncEvent>,
}

impl SessionOutput {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }

    /// Append `other` after the contents of `self`.
    pub fn extend(&mut self, other: SessionOutput) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    /// Hand every event to `sink`, leaving only the outbound bytes.
    pub fn deliver(&mut self, sink: &mut impl MissionSink) {
        for event in self.events.drain(..) {
            match event {
                SyncEvent::Progress(progress) => sink.on_progress(progress),
                SyncEvent::ActiveChanged(active) => sink.on_active_changed(active),
                SyncEvent::Finished { kind, result } => sink.on_finished(kind, result),
                SyncEvent::LinkStats(stats) => sink.on_link_stats(stats),
                SyncEvent::Passthrough(frame) => sink.on_passthrough(frame),
            }
        }
    }
}

/// One vehicle connection.
#[derive(Debug)]
pub struct VehicleBridge {
    config: SyncConfig,
    channel: ChannelState,
    engine: SyncEngine,
}

impl VehicleBridge {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            channel: ChannelState::new(config.receive_buffer_capacity, config.stats_window),
            engine: SyncEngine::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn channel(&self) -> &ChannelState {
        &self.channel
    }

    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    pub fn is_active(&self) -> bool {
        self.engine.is_active()
    }

    pub fn progress(&self) -> f32 {
        self.engine.progress()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    pub fn pending_action(&self) -> Option<&str> {
        self.engine.pending_action()
    }

    pub fn start_read(&mut self, now: Instant) -> Result<SessionOutput> {
        let actions = self.engine.start_read(now)?;
        Ok(self.execute(actions))
    }

    pub fn start_write(&mut self, mission: Mission, now: Instant) -> Result<SessionOutput> {
        let actions = self.engine.start_write(mission, now)?;
        Ok(self.execute(actions))
    }

    pub fn start_remove_all(&mut self, now: Instant) -> Result<SessionOutput> {
        let actions = self.engine.start_remove_all(now)?;
        Ok(self.execute(actions))
    }

    pub fn start_command(&mut self, request: BankRequest, now: Instant) -> Result<SessionOutput> {
        let actions = self.engine.start_command(request, now)?;
        Ok(self.execute(actions))
    }

    /// Process one chunk of transport bytes.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        for frame in self.channel.decode(bytes) {
            trace!(
                class = frame.class.id(),
                subtype = frame.subtype,
                source = frame.source_id,
                sequence = frame.sequence,
                "frame decoded"
            );
            if let Some(stats) = self.channel.record(&frame) {
                output.events.push(SyncEvent::LinkStats(stats));
            }
            output.extend(self.on_frame(frame, now));
        }
        output
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> SessionOutput {
        // Only traffic between this vehicle and this ground station drives the engine.
        if frame.source_id != self.config.vehicle_id || frame.target_id != self.config.ground_id {
            return passthrough(frame);
        }
        match Receiver::route(&frame) {
            Ok(Some(inbound)) => {
                let actions = self.engine.handle_inbound(inbound, now);
                self.execute(actions)
            }
            Ok(None) => passthrough(frame),
            Err(err) => {
                warn!(
                    class = frame.class.id(),
                    subtype = frame.subtype,
                    %err,
                    "dropping malformed response"
                );
                SessionOutput::default()
            }
        }
    }

    /// Fire the acknowledgment timer if due.
    pub fn on_timer(&mut self, now: Instant) -> SessionOutput {
        let actions = self.engine.handle_timeout(now);
        self.execute(actions)
    }

    /// Abort the active transaction with `error`.
    pub fn abort(&mut self, error: SyncError) -> SessionOutput {
        let actions = self.engine.abort(error);
        self.execute(actions)
    }

    fn execute(&mut self, actions: Vec<SyncAction>) -> SessionOutput {
        let mut output = SessionOutput::default();
        for action in actions {
            match action {
                SyncAction::SendFrame(frame) => {
                    output.outbound.push(codec::encode(&frame, &mut self.channel));
                }
                SyncAction::Progress(progress) => output.events.push(SyncEvent::Progress(progress)),
                SyncAction::ActiveChanged(active) => {
                    output.events.push(SyncEvent::ActiveChanged(active));
                }
                SyncAction::Finished { kind, result } => {
                    output.events.push(SyncEvent::Finished { kind, result });
                }
            }
        }
        output
    }
}

fn passthrough(frame: Frame) -> SessionOutput {
    SessionOutput {
        outbound: Vec::new(),
        events: vec![SyncEvent::Passthrough(frame)],
    }
}
