//! # monitor
//!
//! The coordinating task for detection and escalation.
//!
//! ## Architecture
//! ```text
//! readings (mpsc) ──► ThresholdDetector ──trigger──► EscalationGate
//!                                                       │ granted
//!                         latest GPS (watch) ──join──► AlertEnvelope ──► submit task
//!                                                                          │
//!                      verdict / failure ◄── completions (mpsc) ◄──────────┘
//! ```
//! The detector and the gate are owned by this task alone, so the cooldown
//! timestamp and the in-flight flag have a single writer. Submissions run in
//! spawned tasks and report back over a channel.
//!
//! ## Invariants
//! - Every completion clears the in-flight mark and resets the detector,
//!   whatever its outcome
//! - A completion from before the last disconnect is ignored (audited, not
//!   published). Submissions are tagged with the connection's session number
//!   and compared against its current value on completion, so a disconnect is
//!   caught even when a reconnect follows before this task wakes up

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sentry_types::{AlertEnvelope, AlertVerdict, GpsFix, SensorReading, ThresholdResult};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::detector::{DetectorConfig, ThresholdDetector};
use crate::escalation::{Admission, ConfirmationService, EscalationError, EscalationGate};

/// Snapshot published after every escalation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscalationStatus {
    pub processing: bool,
    pub last_verdict: Option<AlertVerdict>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub last_threshold: Option<ThresholdResult>,
}

pub struct MonitorInputs {
    pub readings: mpsc::Receiver<SensorReading>,
    pub latest_gps: watch::Receiver<Option<GpsFix>>,
    pub cooldown: watch::Receiver<Duration>,
    /// Session number from the connection manager.
    pub session: watch::Receiver<u64>,
}

#[derive(Clone)]
pub struct MonitorHandle {
    triggers: broadcast::Sender<ThresholdResult>,
    verdicts: broadcast::Sender<AlertVerdict>,
    status: watch::Receiver<EscalationStatus>,
}

impl MonitorHandle {
    /// Triggers admitted for escalation.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<ThresholdResult> {
        self.triggers.subscribe()
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<AlertVerdict> {
        self.verdicts.subscribe()
    }

    pub fn status(&self) -> EscalationStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<EscalationStatus> {
        self.status.clone()
    }
}

struct Completion {
    ticket: u64,
    session: u64,
    device_id: String,
    result: Result<AlertVerdict, EscalationError>,
}

pub struct CrashMonitor {
    detector: ThresholdDetector,
    gate: EscalationGate,
    service: Arc<dyn ConfirmationService>,
    submit_timeout: Duration,
    audit: AuditLogger,
    latest_gps: watch::Receiver<Option<GpsFix>>,
    /// Completions tagged with an older session are stale.
    session: watch::Receiver<u64>,
    done_tx: mpsc::Sender<Completion>,
    triggers: broadcast::Sender<ThresholdResult>,
    verdicts: broadcast::Sender<AlertVerdict>,
    status: watch::Sender<EscalationStatus>,
}

impl CrashMonitor {
    pub fn spawn(
        detector: DetectorConfig,
        submit_timeout: Duration,
        service: Arc<dyn ConfirmationService>,
        audit: AuditLogger,
        inputs: MonitorInputs,
    ) -> (MonitorHandle, JoinHandle<()>) {
        let (triggers, _) = broadcast::channel(32);
        let (verdicts, _) = broadcast::channel(32);
        let (status_tx, status) = watch::channel(EscalationStatus::default());
        let (done_tx, done_rx) = mpsc::channel(8);

        let monitor = Self {
            detector: ThresholdDetector::new(detector),
            gate: EscalationGate::new(*inputs.cooldown.borrow()),
            service,
            submit_timeout,
            audit,
            latest_gps: inputs.latest_gps,
            session: inputs.session.clone(),
            done_tx,
            triggers: triggers.clone(),
            verdicts: verdicts.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(monitor.run(inputs.readings, done_rx, inputs.cooldown, inputs.session));
        (MonitorHandle { triggers, verdicts, status }, task)
    }

    async fn run(
        mut self,
        mut readings: mpsc::Receiver<SensorReading>,
        mut done_rx: mpsc::Receiver<Completion>,
        mut cooldown: watch::Receiver<Duration>,
        mut session: watch::Receiver<u64>,
    ) {
        let mut cooldown_open = true;
        let mut session_open = true;
        loop {
            tokio::select! {
                reading = readings.recv() => match reading {
                    Some(r) => self.on_reading(r).await,
                    None => break,
                },
                Some(done) = done_rx.recv() => self.on_completion(done).await,
                changed = cooldown.changed(), if cooldown_open => {
                    if changed.is_err() {
                        cooldown_open = false;
                        continue;
                    }
                    let value = *cooldown.borrow_and_update();
                    info!("⏱️ Escalation cooldown set to {}s", value.as_secs());
                    self.gate.set_cooldown(value);
                }
                changed = session.changed(), if session_open => {
                    if changed.is_err() {
                        session_open = false;
                        continue;
                    }
                    let ended = *session.borrow_and_update();
                    debug!("link torn down (session {ended}), detector reset");
                    self.detector.reset();
                }
            }
        }
        debug!("crash monitor stopping");
    }

    async fn on_reading(&mut self, reading: SensorReading) {
        let result = self.detector.evaluate(&reading);
        if !result.is_triggered {
            return;
        }
        let device_id = reading.device_id.clone();

        let ticket = match self.gate.admit(&device_id, Instant::now()) {
            Admission::Granted(ticket) => ticket,
            Admission::CoolingDown { remaining } => {
                info!("⏳ Rate limited: wait {}s more before alerting again", remaining.as_secs_f64().ceil());
                return;
            }
            Admission::InFlight => {
                info!("⏳ Escalation for {device_id} still in flight, trigger dropped");
                return;
            }
        };

        let envelope = AlertEnvelope {
            device_id: device_id.clone(),
            sensor_reading: reading,
            threshold_result: result.clone(),
            timestamp: Utc::now(),
            gps_fix: self.latest_gps.borrow().clone(),
        };
        warn!(
            "🚨 {} {:?} trigger on {device_id}: {:.1} g, tilt {:.0}°{}",
            result.severity,
            result.trigger_type,
            result.g_force,
            result.tilt,
            if envelope.gps_fix.is_some() { "" } else { " (no GPS)" }
        );

        let _ = self.triggers.send(result.clone());
        self.status.send_modify(|s| {
            s.processing = true;
            s.last_verdict = None;
            s.last_alert_at = Some(envelope.timestamp);
            s.last_threshold = Some(result);
        });
        self.audit
            .append(AuditEventType::EscalationSubmitted, json!({ "ticket": ticket, "envelope": envelope }))
            .await;

        let service = self.service.clone();
        let limit = self.submit_timeout;
        let done_tx = self.done_tx.clone();
        let session = *self.session.borrow();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, service.confirm(&envelope)).await {
                Ok(r) => r,
                Err(_) => Err(EscalationError::Timeout(limit)),
            };
            let _ = done_tx
                .send(Completion { ticket, session, device_id, result })
                .await;
        });
    }

    async fn on_completion(&mut self, done: Completion) {
        self.gate.complete(done.ticket);
        self.detector.reset();
        let processing = self.gate.is_processing();

        if done.session != *self.session.borrow() {
            info!("Ignoring escalation result for {}: device disconnected since submission", done.device_id);
            self.status.send_modify(|s| s.processing = processing);
            let outcome = match &done.result {
                Ok(v) => json!({ "verdict": v }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            self.audit
                .append(
                    AuditEventType::VerdictDiscarded,
                    json!({ "ticket": done.ticket, "device_id": done.device_id, "outcome": outcome }),
                )
                .await;
            return;
        }

        match done.result {
            Ok(verdict) => {
                info!(
                    "📨 Verdict for {}: crash={} confidence={:.2} severity={}",
                    done.device_id, verdict.is_crash, verdict.confidence, verdict.severity
                );
                self.gate.record_verdict(verdict.clone());
                self.status.send_modify(|s| {
                    s.processing = processing;
                    s.last_verdict = Some(verdict.clone());
                });
                self.audit
                    .append(AuditEventType::VerdictReceived, json!({ "ticket": done.ticket, "verdict": verdict }))
                    .await;
                let _ = self.verdicts.send(verdict);
            }
            Err(e) => {
                warn!("❌ Escalation for {} failed: {e}", done.device_id);
                self.gate.clear_verdict();
                self.status.send_modify(|s| {
                    s.processing = processing;
                    s.last_verdict = None;
                });
                self.audit
                    .append(
                        AuditEventType::EscalationFailed,
                        json!({ "ticket": done.ticket, "device_id": done.device_id, "error": e.to_string() }),
                    )
                    .await;
            }
        }
    }
}
