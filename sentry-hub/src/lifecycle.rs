//! # lifecycle
//!
//! Connection state machine as a pure transition function.
//!
//! `transition(state, event) -> (state, effects)` decides; the connection
//! manager task performs the effects (timers, radio calls, replies). Nothing
//! here sleeps or touches the radio, so every path is testable without a clock.
//!
//! ```text
//! Disconnected → Scanning → Disconnected
//! Disconnected | Scanning → Connecting → Connected
//! Connected → Reconnecting → Connecting → Connected        (link lost, retry ok)
//! Reconnecting → Disconnected                              (attempt cap reached)
//! any → Disconnected                                       (explicit disconnect)
//! ```
//!
//! ## Invariants
//! - Every scheduled reconnect and every connect attempt carries a ticket; an
//!   event whose ticket is not the current one is ignored
//! - Explicit disconnect disables auto-reconnect before anything else, so a
//!   reconnect that fires afterwards finds the policy off and does nothing
//! - A successful connect resets the attempt counter
//! - Every teardown advances the session number, so a consumer comparing
//!   numbers sees a disconnect even if it never observed the Disconnected state

use std::time::Duration;

use sentry_types::ConnectionState;

// ── Policy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after an unexpected drop (default 5)
    pub max_attempts: u32,
    /// Delay before the first attempt (default 1 s)
    pub base_delay: Duration,
    /// Upper bound for any delay (default 30 s)
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// `base · 2^(attempt-1)`, capped at `max`. Attempt numbering starts at 1.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

// ── Events & effects ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ScanRequested,
    ScanFinished,
    ConnectRequested { device_id: String },
    ConnectSucceeded { ticket: u64 },
    /// `permanent` marks power/permission failures that retrying cannot fix.
    ConnectFailed { ticket: u64, permanent: bool },
    LinkLost { device_id: String },
    ReconnectDue { ticket: u64 },
    DisconnectRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A connect is already being attempted.
    Busy,
    AlreadyConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Publish the new state.
    Notify(ConnectionState),
    StartScan,
    /// Open a session. `reconnect` attempts use a single link attempt each.
    Connect { device_id: String, ticket: u64, reconnect: bool },
    /// Install the session the connect attempt produced.
    Activate,
    /// Throw away a session whose attempt was superseded.
    Discard,
    ScheduleReconnect { delay: Duration, attempt: u32, ticket: u64 },
    CancelReconnect,
    CancelConnect,
    Teardown,
    Reject(Rejection),
    ReconnectExhausted { attempts: u32 },
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: ConnectionState,
    device_id: Option<String>,
    attempts: u32,
    auto_reconnect: bool,
    reconnecting: bool,
    ticket: u64,
    session: u64,
    policy: ReconnectPolicy,
}

impl Lifecycle {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device_id: None,
            attempts: 0,
            auto_reconnect: false,
            reconnecting: false,
            ticket: 0,
            session: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Number of links torn down so far.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Apply `event` in place and return the effects to perform, in order.
    pub fn apply(&mut self, event: LifecycleEvent) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            LifecycleEvent::ScanRequested => {
                if self.state == ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Scanning, &mut fx);
                }
                fx.push(Effect::StartScan);
            }

            LifecycleEvent::ScanFinished => {
                if self.state == ConnectionState::Scanning {
                    self.set_state(ConnectionState::Disconnected, &mut fx);
                }
            }

            LifecycleEvent::ConnectRequested { device_id } => match self.state {
                ConnectionState::Connecting => fx.push(Effect::Reject(Rejection::Busy)),
                ConnectionState::Connected => fx.push(Effect::Reject(Rejection::AlreadyConnected)),
                ConnectionState::Reconnecting => {
                    fx.push(Effect::CancelReconnect);
                    self.start_connect(device_id, &mut fx);
                }
                ConnectionState::Disconnected | ConnectionState::Scanning => {
                    self.start_connect(device_id, &mut fx);
                }
            },

            LifecycleEvent::ConnectSucceeded { ticket } => {
                if ticket != self.ticket || self.state != ConnectionState::Connecting {
                    fx.push(Effect::Discard);
                    return fx;
                }
                self.attempts = 0;
                self.reconnecting = false;
                fx.push(Effect::Activate);
                self.set_state(ConnectionState::Connected, &mut fx);
            }

            LifecycleEvent::ConnectFailed { ticket, permanent } => {
                if ticket != self.ticket || self.state != ConnectionState::Connecting {
                    return fx;
                }
                if self.reconnecting && self.auto_reconnect && !permanent {
                    self.schedule_retry(&mut fx);
                } else {
                    self.auto_reconnect = false;
                    self.reconnecting = false;
                    self.set_state(ConnectionState::Disconnected, &mut fx);
                }
            }

            LifecycleEvent::LinkLost { device_id } => {
                if self.state != ConnectionState::Connected
                    || self.device_id.as_deref() != Some(device_id.as_str())
                {
                    return fx;
                }
                self.session += 1;
                fx.push(Effect::Teardown);
                if self.auto_reconnect {
                    self.attempts = 0;
                    self.schedule_retry(&mut fx);
                } else {
                    self.set_state(ConnectionState::Disconnected, &mut fx);
                }
            }

            LifecycleEvent::ReconnectDue { ticket } => {
                if ticket != self.ticket
                    || self.state != ConnectionState::Reconnecting
                    || !self.auto_reconnect
                {
                    return fx;
                }
                match self.device_id.clone() {
                    Some(device_id) => {
                        self.set_state(ConnectionState::Connecting, &mut fx);
                        fx.push(Effect::Connect { device_id, ticket, reconnect: true });
                    }
                    None => {
                        self.auto_reconnect = false;
                        self.set_state(ConnectionState::Disconnected, &mut fx);
                    }
                }
            }

            LifecycleEvent::DisconnectRequested => {
                self.auto_reconnect = false;
                self.reconnecting = false;
                self.attempts = 0;
                self.ticket += 1;
                self.session += 1;
                fx.push(Effect::CancelReconnect);
                fx.push(Effect::CancelConnect);
                fx.push(Effect::Teardown);
                self.set_state(ConnectionState::Disconnected, &mut fx);
            }
        }
        fx
    }

    fn start_connect(&mut self, device_id: String, fx: &mut Vec<Effect>) {
        self.ticket += 1;
        self.attempts = 0;
        self.reconnecting = false;
        self.auto_reconnect = true;
        self.device_id = Some(device_id.clone());
        self.set_state(ConnectionState::Connecting, fx);
        fx.push(Effect::Connect { device_id, ticket: self.ticket, reconnect: false });
    }

    fn schedule_retry(&mut self, fx: &mut Vec<Effect>) {
        if self.attempts >= self.policy.max_attempts {
            fx.push(Effect::ReconnectExhausted { attempts: self.attempts });
            self.auto_reconnect = false;
            self.reconnecting = false;
            self.set_state(ConnectionState::Disconnected, fx);
            return;
        }
        self.attempts += 1;
        self.ticket += 1;
        self.reconnecting = true;
        self.set_state(ConnectionState::Reconnecting, fx);
        fx.push(Effect::ScheduleReconnect {
            delay: exponential_backoff(self.policy.base_delay, self.policy.max_delay, self.attempts),
            attempt: self.attempts,
            ticket: self.ticket,
        });
    }

    fn set_state(&mut self, next: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state != next {
            self.state = next;
            fx.push(Effect::Notify(next));
        }
    }
}

/// Pure form of [`Lifecycle::apply`].
pub fn transition(current: &Lifecycle, event: LifecycleEvent) -> (Lifecycle, Vec<Effect>) {
    let mut next = current.clone();
    let effects = next.apply(event);
    (next, effects)
}
