#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use sentry_hub::audit::AuditLogger;
use sentry_hub::escalation::{ConfirmationService, EscalationError};
use sentry_hub::radio::simulated::SimulatedRadio;
use sentry_hub::{PipelineConfig, SentryPipeline};
use sentry_types::{AlertEnvelope, AlertVerdict, ConnectionState};

pub const DEVICE: &str = "C4:DE:E2:10:7A:01";

/// Confirmation service that answers from a script and records every envelope.
/// Once the script runs out it confirms a crash.
#[derive(Default)]
pub struct ScriptedService {
    failures: Mutex<VecDeque<EscalationError>>,
    submitted: Mutex<Vec<AlertEnvelope>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedService {
    pub fn failing_once(error: EscalationError) -> Self {
        let s = Self::default();
        s.failures.lock().unwrap().push_back(error);
        s
    }

    /// Every answer waits for a `notify_one` on `gate`.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate), ..Default::default() }
    }

    pub fn submitted(&self) -> Vec<AlertEnvelope> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfirmationService for ScriptedService {
    async fn confirm(&self, envelope: &AlertEnvelope) -> Result<AlertVerdict, EscalationError> {
        self.submitted.lock().unwrap().push(envelope.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(crash_verdict())
    }
}

pub fn crash_verdict() -> AlertVerdict {
    AlertVerdict {
        is_crash: true,
        confidence: 0.87,
        severity: "high".into(),
        reasoning: "impact above 12 g followed by no movement".into(),
        crash_type: Some("impact".into()),
        key_indicators: vec!["g_force".into()],
        false_positive_risk: Some("low".into()),
    }
}

pub fn motion(sequence: u32, az: f64) -> String {
    format!(
        r#"{{"type":"sensor_data","sequence":{sequence},"sensor":{{"ax":0.0,"ay":0.0,"az":{az:.2},"roll":1.5,"pitch":-0.5,"tilt_detected":false}}}}"#
    )
}

pub fn gps(lat: f64, lon: f64, speed: f64) -> String {
    format!(
        r#"{{"type":"gps_data","gps":{{"fix":true,"satellites":8,"latitude":{lat},"longitude":{lon},"altitude":120.0,"accuracy":3.5,"speed":{speed}}}}}"#
    )
}

pub async fn start(service: Arc<ScriptedService>) -> (Arc<SimulatedRadio>, SentryPipeline) {
    let radio = Arc::new(SimulatedRadio::new());
    radio.add_wearable(DEVICE, "Sentry-7A01", -58);
    let pipeline =
        SentryPipeline::start(radio.clone(), service, PipelineConfig::default(), AuditLogger::new(None)).await;
    (radio, pipeline)
}

pub async fn wait_for_state(pipeline: &SentryPipeline, want: ConnectionState) {
    let mut rx = pipeline.subscribe_state();
    while *rx.borrow_and_update() != want {
        rx.changed().await.unwrap();
    }
}

pub async fn wait_until_idle(pipeline: &SentryPipeline) {
    let mut rx = pipeline.subscribe_status();
    while rx.borrow_and_update().processing {
        rx.changed().await.unwrap();
    }
}
