//! # escalation
//!
//! Tier-2: rate-limited submission of triggered detections to the remote
//! confirmation service.
//!
//! [`EscalationGate`] is the bookkeeping half and owns `last_alert_time` and
//! the in-flight flag; it is only ever touched by the crash monitor task.
//! [`ConfirmationService`] is the I/O half, implemented over HTTP by
//! [`HttpConfirmationClient`] and by scripted fakes in tests.
//!
//! ## Invariants
//! - At most one submission per cooldown window per device
//! - At most one submission in flight per device; a trigger meanwhile is blocked
//! - A blocked trigger changes nothing (no timestamp update, no detector reset)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sentry_types::{AlertEnvelope, AlertVerdict};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub const MIN_COOLDOWN_SECS: u64 = 5;
pub const MAX_COOLDOWN_SECS: u64 = 300;
pub const DEFAULT_COOLDOWN_SECS: u64 = 15;

/// Operator-supplied cooldown, forced into the supported range.
pub fn clamp_cooldown(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(MIN_COOLDOWN_SECS, MAX_COOLDOWN_SECS))
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Confirmation service base URL; alerts go to `{base}/api/v1/device/crash/alert`
    pub api_base_url: String,
    /// Sent as `X-API-Key` when set
    pub api_key: Option<String>,
    pub cooldown: Duration,
    /// A submission not answered within this is treated as failed (default 45 s)
    pub submit_timeout: Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            api_key: None,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            submit_timeout: Duration::from_secs(45),
        }
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Submit now; hand the ticket back to [`EscalationGate::complete`].
    Granted(u64),
    CoolingDown { remaining: Duration },
    InFlight,
}

pub struct EscalationGate {
    cooldown: Duration,
    last_alert: HashMap<String, Instant>,
    in_flight: HashMap<String, u64>,
    next_ticket: u64,
    verdict: Option<AlertVerdict>,
}

impl EscalationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: HashMap::new(),
            in_flight: HashMap::new(),
            next_ticket: 1,
            verdict: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn admit(&mut self, device_id: &str, now: Instant) -> Admission {
        if self.in_flight.contains_key(device_id) {
            return Admission::InFlight;
        }
        if let Some(last) = self.last_alert.get(device_id) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.cooldown {
                return Admission::CoolingDown { remaining: self.cooldown - elapsed };
            }
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.last_alert.insert(device_id.to_string(), now);
        self.in_flight.insert(device_id.to_string(), ticket);
        self.verdict = None;
        Admission::Granted(ticket)
    }

    /// Clear the in-flight mark of `ticket`. Returns false for unknown tickets.
    pub fn complete(&mut self, ticket: u64) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, t| *t != ticket);
        before != self.in_flight.len()
    }

    pub fn is_processing(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn record_verdict(&mut self, verdict: AlertVerdict) {
        self.verdict = Some(verdict);
    }

    pub fn clear_verdict(&mut self) {
        self.verdict = None;
    }

    pub fn verdict(&self) -> Option<&AlertVerdict> {
        self.verdict.as_ref()
    }
}

// ── Confirmation service ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("confirmation service answered HTTP {0}")]
    Status(u16),
    #[error("malformed verdict: {0}")]
    Malformed(String),
    #[error("no verdict within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ConfirmationService: Send + Sync + 'static {
    async fn confirm(&self, envelope: &AlertEnvelope) -> Result<AlertVerdict, EscalationError>;
}

pub struct HttpConfirmationClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConfirmationClient {
    pub fn new(config: &EscalationConfig) -> Result<Self, EscalationError> {
        let http = reqwest::Client::builder()
            .timeout(config.submit_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/api/v1/device/crash/alert",
                config.api_base_url.trim_end_matches('/')
            ),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ConfirmationService for HttpConfirmationClient {
    async fn confirm(&self, envelope: &AlertEnvelope) -> Result<AlertVerdict, EscalationError> {
        let mut req = self.http.post(&self.endpoint).json(envelope);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EscalationError::Status(status.as_u16()));
        }
        let body = resp.bytes().await?;
        debug!("confirmation service answered {} bytes", body.len());
        serde_json::from_slice::<AlertVerdict>(&body).map_err(|e| EscalationError::Malformed(e.to_string()))
    }
}
