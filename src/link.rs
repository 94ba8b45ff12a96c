//! Tokio driver for one vehicle connection.
//!
//! [`VehicleLink::spawn`] moves a [`VehicleBridge`] onto its own task. The
//! task is the only owner of transaction state; it reacts to three inputs
//! (transport bytes, handle requests, the earliest timer) and writes outbound
//! frames through a [`Transmitter`]. Handles are cheap to clone and may be
//! used from any task or thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{SessionOutput, SyncEvent, VehicleBridge};
use crate::config::SyncConfig;
use crate::contracts::{BankRecord, BankRequest, InfoSlot, Mission};
use crate::errors::{Result, SyncError};
use crate::sync_engine::Completion;
use crate::transmitter::Transmitter;

const INBOUND_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 8;
const READ_CHUNK: usize = 1024;

/// Byte-chunk boundary between the driver and a concrete transport.
#[derive(Debug)]
pub struct LinkTransport {
    /// Raw chunks as they arrive, with arbitrary fragmentation
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub transmitter: Transmitter,
}

/// Run a transport over any byte stream (serial port, TCP, in-memory duplex).
pub fn stream_transport<S>(stream: S) -> LinkTransport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
    let (transmitter, mut outbound) = Transmitter::channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "stream read failed");
                    break;
                }
            }
        }
        debug!("stream reader finished");
    });

    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                warn!(%err, "stream write failed");
                break;
            }
        }
        debug!("stream writer finished");
    });

    LinkTransport { inbound, transmitter }
}

/// Run a transport over a UDP socket, talking to a single peer.
pub fn udp_transport(socket: UdpSocket, peer: SocketAddr) -> LinkTransport {
    let socket = Arc::new(socket);
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
    let (transmitter, mut outbound) = Transmitter::channel();

    let rx_socket = Arc::clone(&socket);
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match rx_socket.recv_from(&mut buf).await {
                Ok((n, from)) if from == peer => {
                    if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok((_, from)) => debug!(%from, "datagram from unknown peer ignored"),
                Err(err) => {
                    warn!(%err, "udp receive failed");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(err) = socket.send_to(&bytes, peer).await {
                warn!(%err, %peer, "udp send failed");
            }
        }
    });

    LinkTransport { inbound, transmitter }
}

enum LinkRequest {
    Read(oneshot::Sender<Result<Mission>>),
    Write(Mission, oneshot::Sender<Result<()>>),
    RemoveAll(oneshot::Sender<Result<()>>),
    Command(BankRequest, oneshot::Sender<Result<()>>),
}

enum Reply {
    Mission(oneshot::Sender<Result<Mission>>),
    Done(oneshot::Sender<Result<()>>),
}

impl Reply {
    fn complete(self, result: Result<Completion>) {
        // A dropped receiver only means the caller stopped waiting.
        match self {
            Self::Mission(tx) => {
                let mission = result.and_then(|completion| match completion {
                    Completion::Read(mission) => Ok(mission),
                    other => Err(SyncError::Internal(format!("expected a mission, got {other:?}"))),
                });
                let _ = tx.send(mission);
            }
            Self::Done(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
        }
    }

    fn fail(self, error: SyncError) {
        self.complete(Err(error));
    }
}

/// Handle to a running vehicle driver.
#[derive(Debug, Clone)]
pub struct VehicleLink {
    requests: mpsc::Sender<LinkRequest>,
    progress: watch::Receiver<f32>,
    active: watch::Receiver<bool>,
}

impl std::fmt::Debug for LinkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read(_) => "read",
            Self::Write(..) => "write",
            Self::RemoveAll(_) => "remove-all",
            Self::Command(..) => "command",
        };
        f.write_str(name)
    }
}

impl VehicleLink {
    /// Start the driver task. Must be called inside a tokio runtime.
    ///
    /// The returned receiver carries every [`SyncEvent`], including telemetry
    /// passthrough and link statistics; dropping it is fine.
    pub fn spawn(
        config: SyncConfig,
        transport: LinkTransport,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncEvent>)> {
        let transaction_timeout = config.transaction_timeout();
        let bridge = VehicleBridge::new(config)?;
        let (requests_tx, requests) = mpsc::channel(COMMAND_QUEUE);
        let (progress_tx, progress) = watch::channel(0.0);
        let (active_tx, active) = watch::channel(false);
        let (events_tx, events) = mpsc::unbounded_channel();

        let driver = LinkDriver {
            bridge,
            requests,
            inbound: transport.inbound,
            transmitter: transport.transmitter,
            progress: progress_tx,
            active: active_tx,
            events: events_tx,
            reply: None,
            watchdog: None,
            transaction_timeout,
        };
        tokio::spawn(driver.run());

        let link = Self {
            requests: requests_tx,
            progress,
            active,
        };
        Ok((link, events))
    }

    /// Download every bank and info-slot.
    pub async fn read_mission(&self) -> Result<Mission> {
        self.request(LinkRequest::Read).await
    }

    /// Download the mission as parallel record / slot lists.
    pub async fn read_parts(&self) -> Result<(Vec<BankRecord>, Vec<Vec<InfoSlot>>)> {
        self.read_mission().await.map(Mission::into_parts)
    }

    pub async fn write_mission(&self, mission: Mission) -> Result<()> {
        self.request(|reply| LinkRequest::Write(mission, reply)).await
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.request(LinkRequest::RemoveAll).await
    }

    /// Send one of the auto-switch commands.
    pub async fn command(&self, request: BankRequest) -> Result<()> {
        self.request(|reply| LinkRequest::Command(request, reply)).await
    }

    pub fn progress(&self) -> watch::Receiver<f32> {
        self.progress.clone()
    }

    pub fn active(&self) -> watch::Receiver<bool> {
        self.active.clone()
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> LinkRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(make(tx)).await.map_err(|_| SyncError::LinkClosed)?;
        rx.await.map_err(|_| SyncError::LinkClosed)?
    }
}

struct LinkDriver {
    bridge: VehicleBridge,
    requests: mpsc::Receiver<LinkRequest>,
    inbound: mpsc::Receiver<Vec<u8>>,
    transmitter: Transmitter,
    progress: watch::Sender<f32>,
    active: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SyncEvent>,
    reply: Option<Reply>,
    watchdog: Option<Instant>,
    transaction_timeout: std::time::Duration,
}

impl LinkDriver {
    async fn run(mut self) {
        info!(vehicle_id = self.bridge.config().vehicle_id, "vehicle link started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.start(request),
                    None => {
                        debug!("all link handles dropped");
                        break;
                    }
                },
                chunk = self.inbound.recv() => match chunk {
                    Some(bytes) => {
                        let output = self.bridge.on_bytes(&bytes, now());
                        self.flush(output);
                    }
                    None => {
                        warn!("transport closed");
                        let output = self.bridge.abort(SyncError::LinkClosed);
                        self.flush(output);
                        break;
                    }
                },
                _ = sleep_until(wake) => self.on_wake(now()),
            }
        }

        if let Some(reply) = self.reply.take() {
            reply.fail(SyncError::LinkClosed);
        }
        info!("vehicle link stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        match (self.bridge.next_deadline(), self.watchdog) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn start(&mut self, request: LinkRequest) {
        let now = now();
        let (started, reply) = match request {
            LinkRequest::Read(tx) => (self.bridge.start_read(now), Reply::Mission(tx)),
            LinkRequest::Write(mission, tx) => {
                (self.bridge.start_write(mission, now), Reply::Done(tx))
            }
            LinkRequest::RemoveAll(tx) => (self.bridge.start_remove_all(now), Reply::Done(tx)),
            LinkRequest::Command(request, tx) => {
                (self.bridge.start_command(request, now), Reply::Done(tx))
            }
        };
        match started {
            Ok(output) => {
                self.reply = Some(reply);
                self.watchdog = Some(now + self.transaction_timeout);
                self.flush(output);
            }
            Err(err) => {
                warn!(%err, "request rejected");
                reply.fail(err);
            }
        }
    }

    fn on_wake(&mut self, now: Instant) {
        if self.watchdog.is_some_and(|at| now >= at) && self.bridge.is_active() {
            let action = self
                .bridge
                .pending_action()
                .map_or_else(|| self.bridge.state().name().to_string(), str::to_string);
            let output = self.bridge.abort(SyncError::AckTimeout {
                action,
                waited: self.transaction_timeout,
            });
            self.flush(output);
            return;
        }
        let output = self.bridge.on_timer(now);
        self.flush(output);
    }

    fn flush(&mut self, mut output: SessionOutput) {
        let outbound = std::mem::take(&mut output.outbound);
        if let Err(err) = self.transmitter.send_batch(outbound) {
            error!(%err, "cannot hand frame to transport");
            output.extend(self.bridge.abort(err));
        }
        for event in output.events {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: SyncEvent) {
        match &event {
            SyncEvent::Progress(progress) => {
                self.progress.send_replace(*progress);
            }
            SyncEvent::ActiveChanged(active) => {
                self.active.send_replace(*active);
                if !active {
                    self.watchdog = None;
                }
            }
            SyncEvent::Finished { result, .. } => {
                if let Some(reply) = self.reply.take() {
                    reply.complete(result.clone());
                }
            }
            SyncEvent::LinkStats(_) | SyncEvent::Passthrough(_) => {}
        }
        let _ = self.events.send(event);
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_transport() -> (
        LinkTransport,
        mpsc::Sender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound) = mpsc::channel(4);
        let (transmitter, outbound) = Transmitter::channel();
        (LinkTransport { inbound, transmitter }, inbound_tx, outbound)
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reaches_caller() {
        let (transport, _inbound, mut outbound) = silent_transport();
        let config = SyncConfig::default().with_ack_timeout_ms(10).with_max_retries(2);
        let (link, _events) = VehicleLink::spawn(config, transport).unwrap();

        let result = link.remove_all().await;
        assert!(matches!(result, Err(SyncError::MaxRetryExceeded { attempts: 3, .. })));

        let mut sent = 0;
        while outbound.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, 3);
        assert!(!link.is_active());
    }

    #[tokio::test]
    async fn test_watchdog_aborts_long_transaction() {
        let (transport, _inbound, _outbound) = silent_transport();
        let config = SyncConfig::default()
            .with_ack_timeout_ms(1_000)
            .with_transaction_timeout_ms(20);
        let (link, _events) = VehicleLink::spawn(config, transport).unwrap();
        let result = link.read_mission().await;
        assert!(matches!(
            result,
            Err(SyncError::AckTimeout { ref action, .. }) if action == "query all banks"
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_fails_request() {
        let (transport, inbound, _outbound) = silent_transport();
        let (link, _events) = VehicleLink::spawn(SyncConfig::default(), transport).unwrap();
        drop(inbound);
        let result = link.read_mission().await;
        assert_eq!(result, Err(SyncError::LinkClosed));
    }
}
