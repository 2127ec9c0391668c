//! # connection
//!
//! The task that owns the [`Lifecycle`] and performs its effects.
//!
//! ## Architecture
//! Callers talk to it through a cloneable [`ConnectionHandle`] (commands over
//! mpsc, state and session number over watch). Long-running work (scans, connect attempts,
//! reconnect timers) runs in spawned tasks that report back on an internal
//! channel, so the manager itself never blocks on the radio and always sees
//! events in one order.
//!
//! ```text
//! handle ──Command──► manager ──effects──► TransportAdapter
//!                       ▲   ▲
//!   connect/scan tasks ─┘   └── LinkLost (transport watcher)
//! ```

use std::sync::Arc;
use std::time::Duration;

use sentry_types::{ConnectionState, DeviceDescriptor};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::lifecycle::{Effect, Lifecycle, LifecycleEvent, ReconnectPolicy};
use crate::transport::{LinkLost, Session, TransportAdapter, TransportError};

type Reply<T> = oneshot::Sender<Result<T, HubError>>;

enum Command {
    Scan { duration: Duration, reply: Reply<Vec<DeviceDescriptor>> },
    Connect { device_id: String, reply: Reply<bool> },
    Disconnect { reply: oneshot::Sender<()> },
}

enum Internal {
    ConnectDone { ticket: u64, result: Result<Session, TransportError> },
    ReconnectDue { ticket: u64 },
    ScanDone { result: Result<Vec<DeviceDescriptor>, TransportError> },
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    session: watch::Receiver<u64>,
}

impl ConnectionHandle {
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DeviceDescriptor>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Scan { duration, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Resolves once the attempt ends: `Ok(true)` connected, `Ok(false)` the
    /// device could not be reached, `Err` the request was refused or the radio
    /// is unusable.
    pub async fn connect(&self, device_id: &str) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { device_id: device_id.to_string(), reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    pub async fn disconnect(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Advances on every teardown. Unlike the state, a change here cannot be
    /// overwritten by a connect that follows immediately.
    pub fn subscribe_session(&self) -> watch::Receiver<u64> {
        self.session.clone()
    }

    async fn send(&self, cmd: Command) -> Result<(), HubError> {
        self.commands.send(cmd).await.map_err(|_| HubError::Closed)
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct PendingConnect {
    ticket: u64,
    device_id: String,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    lifecycle: Lifecycle,
    transport: Arc<TransportAdapter>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<u64>,
    internal_tx: mpsc::Sender<Internal>,
    /// Reply for the manual connect carrying this ticket.
    connect_reply: Option<(u64, Reply<bool>)>,
    connecting: Option<PendingConnect>,
    session: Option<Session>,
    reconnect_timer: Option<JoinHandle<()>>,
    scan_reply: Option<Reply<Vec<DeviceDescriptor>>>,
    scan_duration: Duration,
    max_attempts: u32,
}

impl ConnectionManager {
    /// Start the manager. It stops once every handle is dropped, tearing down
    /// whatever link is still up.
    pub fn spawn(
        transport: Arc<TransportAdapter>,
        link_rx: mpsc::Receiver<LinkLost>,
        policy: ReconnectPolicy,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session) = watch::channel(0);
        let (internal_tx, internal_rx) = mpsc::channel(16);

        let manager = Self {
            lifecycle: Lifecycle::new(policy),
            transport,
            state_tx,
            session_tx,
            internal_tx,
            connect_reply: None,
            connecting: None,
            session: None,
            reconnect_timer: None,
            scan_reply: None,
            scan_duration: Duration::ZERO,
            max_attempts: policy.max_attempts,
        };
        let task = tokio::spawn(manager.run(commands_rx, internal_rx, link_rx));
        (ConnectionHandle { commands, state, session }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut link_rx: mpsc::Receiver<LinkLost>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                Some(msg) = internal.recv() => self.on_internal(msg).await,
                Some(lost) = link_rx.recv() => {
                    self.handle(LifecycleEvent::LinkLost { device_id: lost.device_id }, None).await;
                }
            }
        }

        debug!("connection manager stopping");
        self.handle(LifecycleEvent::DisconnectRequested, None).await;
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Scan { duration, reply } => {
                if self.scan_reply.is_some() {
                    let _ = reply.send(Err(HubError::ScanInProgress));
                    return;
                }
                self.scan_reply = Some(reply);
                self.scan_duration = duration;
                self.handle(LifecycleEvent::ScanRequested, None).await;
            }
            Command::Connect { device_id, reply } => {
                self.handle(LifecycleEvent::ConnectRequested { device_id }, Some(reply)).await;
            }
            Command::Disconnect { reply } => {
                self.handle(LifecycleEvent::DisconnectRequested, None).await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ConnectDone { ticket, result } => {
                if self.connecting.as_ref().map(|p| p.ticket) == Some(ticket) {
                    self.connecting = None;
                }
                match result {
                    Ok(session) => {
                        self.session = Some(session);
                        self.handle(LifecycleEvent::ConnectSucceeded { ticket }, None).await;
                    }
                    Err(e) => {
                        let permanent = e.is_permanent();
                        self.handle(LifecycleEvent::ConnectFailed { ticket, permanent }, None).await;
                        if let Some(reply) = self.take_reply(ticket) {
                            let _ = reply.send(if permanent { Err(e.into()) } else { Ok(false) });
                        }
                    }
                }
            }
            Internal::ReconnectDue { ticket } => {
                self.reconnect_timer = None;
                self.handle(LifecycleEvent::ReconnectDue { ticket }, None).await;
            }
            Internal::ScanDone { result } => {
                self.handle(LifecycleEvent::ScanFinished, None).await;
                if let Some(reply) = self.scan_reply.take() {
                    let _ = reply.send(result.map_err(HubError::from));
                }
            }
        }
    }

    fn take_reply(&mut self, ticket: u64) -> Option<Reply<bool>> {
        match self.connect_reply.take() {
            Some((t, reply)) if t == ticket => Some(reply),
            other => {
                self.connect_reply = other;
                None
            }
        }
    }

    /// Feed `event` to the lifecycle and run the resulting effects in order.
    async fn handle(&mut self, event: LifecycleEvent, mut reply: Option<Reply<bool>>) {
        let ticket = self.lifecycle.ticket();
        let effects = self.lifecycle.apply(event);
        for effect in effects {
            self.execute(effect, ticket, &mut reply).await;
        }
    }

    async fn execute(&mut self, effect: Effect, prior_ticket: u64, reply: &mut Option<Reply<bool>>) {
        match effect {
            Effect::Notify(state) => {
                info!("📶 Connection state: {state}");
                self.state_tx.send_replace(state);
            }

            Effect::StartScan => {
                let transport = self.transport.clone();
                let internal = self.internal_tx.clone();
                let duration = self.scan_duration;
                tokio::spawn(async move {
                    let result = transport.scan(duration).await;
                    let _ = internal.send(Internal::ScanDone { result }).await;
                });
            }

            Effect::Connect { device_id, ticket, reconnect } => {
                if let Some(reply) = reply.take() {
                    self.connect_reply = Some((ticket, reply));
                }
                let attempts = if reconnect { 1 } else { self.transport.config().connect_attempts };
                let attempt_timeout = self.transport.config().attempt_timeout;
                let transport = self.transport.clone();
                let internal = self.internal_tx.clone();
                let id = device_id.clone();
                let task = tokio::spawn(async move {
                    let result = transport.open_session(&id, attempts, attempt_timeout).await;
                    let _ = internal.send(Internal::ConnectDone { ticket, result }).await;
                });
                self.connecting = Some(PendingConnect { ticket, device_id, task });
            }

            Effect::Activate => {
                if let Some(session) = self.session.take() {
                    self.transport.activate(session).await;
                }
                let ticket = self.lifecycle.ticket();
                if let Some(reply) = self.take_reply(ticket) {
                    let _ = reply.send(Ok(true));
                }
            }

            Effect::Discard => {
                if let Some(session) = self.session.take() {
                    debug!("discarding superseded session for {}", session.device_id());
                    if self.lifecycle.state() == ConnectionState::Disconnected {
                        self.transport.discard(session).await;
                    }
                }
            }

            Effect::ScheduleReconnect { delay, attempt, ticket } => {
                if let Some(timer) = self.reconnect_timer.take() {
                    timer.abort();
                }
                info!("🔄 Reconnect attempt {attempt}/{} in {delay:?}", self.max_attempts);
                let internal = self.internal_tx.clone();
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = internal.send(Internal::ReconnectDue { ticket }).await;
                }));
            }

            Effect::CancelReconnect => {
                if let Some(timer) = self.reconnect_timer.take() {
                    timer.abort();
                }
            }

            Effect::CancelConnect => {
                if let Some(pending) = self.connecting.take() {
                    pending.task.abort();
                    self.transport.release(&pending.device_id).await;
                }
                if let Some(reply) = self.take_reply(prior_ticket) {
                    let _ = reply.send(Ok(false));
                }
            }

            Effect::Teardown => {
                self.session_tx.send_replace(self.lifecycle.session());
                self.transport.disconnect().await;
            }

            Effect::Reject(rejection) => {
                debug!("connect refused: {rejection:?}");
                if let Some(reply) = reply.take() {
                    let _ = reply.send(Err(rejection.into()));
                }
            }

            Effect::ReconnectExhausted { attempts } => {
                warn!("❌ Gave up reconnecting after {attempts} attempts");
            }
        }
    }
}
