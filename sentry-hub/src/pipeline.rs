//! # pipeline
//!
//! [`SentryPipeline`] wires the stages together and is the one object an
//! embedder (or the HTTP surface) holds.
//!
//! ```text
//! Radio ─► TransportAdapter ─telemetry─► Distribution ─readings─► CrashMonitor
//!              ▲      │ link lost            │ broadcast               │ broadcast
//!              │      ▼                      ▼                         ▼
//!          ConnectionManager ─state─►   on_reading / GPS      on_threshold_trigger / on_verdict
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sentry_types::{AlertVerdict, ConnectionState, DeviceDescriptor, GpsFix, SensorReading, ThresholdResult};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::HubConfig;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::detector::DetectorConfig;
use crate::distribution::Distribution;
use crate::error::HubError;
use crate::escalation::{clamp_cooldown, ConfirmationService, EscalationConfig};
use crate::lifecycle::ReconnectPolicy;
use crate::monitor::{CrashMonitor, EscalationStatus, MonitorHandle, MonitorInputs};
use crate::persistence::{load_settings, save_settings, HubSettings};
use crate::radio::Radio;
use crate::transport::{TransportAdapter, TransportConfig};

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub transport: TransportConfig,
    pub reconnect: ReconnectPolicy,
    pub detector: DetectorConfig,
    pub escalation: EscalationConfig,
    /// Persist cooldown and last device here; `None` keeps settings in memory
    pub settings_path: Option<PathBuf>,
}

impl From<&HubConfig> for PipelineConfig {
    fn from(c: &HubConfig) -> Self {
        Self {
            transport: c.transport.clone(),
            reconnect: c.reconnect,
            detector: c.detector,
            escalation: c.escalation.clone(),
            settings_path: Some(c.settings_path.clone()),
        }
    }
}

pub struct SentryPipeline {
    connection: ConnectionHandle,
    distribution: Distribution,
    monitor: MonitorHandle,
    cooldown: watch::Sender<Duration>,
    settings: Mutex<HubSettings>,
    settings_path: Option<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
}

impl SentryPipeline {
    pub async fn start(
        radio: Arc<dyn Radio>,
        service: Arc<dyn ConfirmationService>,
        config: PipelineConfig,
        audit: AuditLogger,
    ) -> Self {
        let settings = match &config.settings_path {
            Some(path) => load_settings(path).await,
            None => None,
        };
        let cooldown = match &settings {
            Some(s) => clamp_cooldown(s.cooldown_seconds),
            None => config.escalation.cooldown,
        };
        let settings = HubSettings {
            cooldown_seconds: cooldown.as_secs(),
            ..settings.unwrap_or_default()
        };

        let (transport, telemetry_rx, link_rx) = TransportAdapter::new(radio, config.transport);
        let (connection, connection_task) =
            ConnectionManager::spawn(Arc::new(transport), link_rx, config.reconnect);

        let (detection_tx, detection_rx) = mpsc::channel(64);
        let (distribution, distribution_task) =
            Distribution::spawn(telemetry_rx, detection_tx, connection.subscribe_session());

        let (cooldown_tx, cooldown_rx) = watch::channel(cooldown);
        let (monitor, monitor_task) = CrashMonitor::spawn(
            config.detector,
            config.escalation.submit_timeout,
            service,
            audit,
            MonitorInputs {
                readings: detection_rx,
                latest_gps: distribution.gps_watch(),
                cooldown: cooldown_rx,
                session: connection.subscribe_session(),
            },
        );

        info!("🛡️ Sentry pipeline ready (cooldown {}s)", cooldown.as_secs());
        Self {
            connection,
            distribution,
            monitor,
            cooldown: cooldown_tx,
            settings: Mutex::new(settings),
            settings_path: config.settings_path,
            tasks: vec![connection_task, distribution_task, monitor_task],
        }
    }

    // ── Caller operations ─────────────────────────────────────────────────────

    pub async fn scan_for_devices(&self, duration: Duration) -> Result<Vec<DeviceDescriptor>, HubError> {
        self.connection.scan(duration).await
    }

    pub async fn connect(&self, device_id: &str) -> Result<bool, HubError> {
        let connected = self.connection.connect(device_id).await?;
        if connected {
            let mut settings = self.settings.lock().await;
            if settings.last_device_id.as_deref() != Some(device_id) {
                settings.last_device_id = Some(device_id.to_string());
                self.persist(&settings).await;
            }
        }
        Ok(connected)
    }

    pub async fn disconnect(&self) -> Result<(), HubError> {
        self.connection.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Returns the cooldown actually applied after clamping.
    pub async fn set_cooldown_seconds(&self, seconds: u64) -> Duration {
        let cooldown = clamp_cooldown(seconds);
        if cooldown.as_secs() != seconds {
            warn!("cooldown {seconds}s out of range, using {}s", cooldown.as_secs());
        }
        self.cooldown.send_replace(cooldown);

        let mut settings = self.settings.lock().await;
        settings.cooldown_seconds = cooldown.as_secs();
        self.persist(&settings).await;
        cooldown
    }

    pub fn cooldown(&self) -> Duration {
        *self.cooldown.borrow()
    }

    pub async fn settings(&self) -> HubSettings {
        self.settings.lock().await.clone()
    }

    pub fn escalation_status(&self) -> EscalationStatus {
        self.monitor.status()
    }

    pub fn latest_gps(&self) -> Option<GpsFix> {
        self.distribution.latest_gps()
    }

    // ── Callbacks ─────────────────────────────────────────────────────────────

    pub fn on_reading(&self, callback: impl Fn(SensorReading) + Send + 'static) -> JoinHandle<()> {
        forward(self.subscribe_readings(), callback)
    }

    pub fn on_gps(&self, callback: impl Fn(GpsFix) + Send + 'static) -> JoinHandle<()> {
        forward(self.subscribe_gps(), callback)
    }

    pub fn on_threshold_trigger(&self, callback: impl Fn(ThresholdResult) + Send + 'static) -> JoinHandle<()> {
        forward(self.subscribe_triggers(), callback)
    }

    pub fn on_verdict(&self, callback: impl Fn(AlertVerdict) + Send + 'static) -> JoinHandle<()> {
        forward(self.subscribe_verdicts(), callback)
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub fn subscribe_readings(&self) -> broadcast::Receiver<SensorReading> {
        self.distribution.subscribe_readings()
    }

    pub fn subscribe_gps(&self) -> broadcast::Receiver<GpsFix> {
        self.distribution.subscribe_gps()
    }

    pub fn subscribe_triggers(&self) -> broadcast::Receiver<ThresholdResult> {
        self.monitor.subscribe_triggers()
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<AlertVerdict> {
        self.monitor.subscribe_verdicts()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EscalationStatus> {
        self.monitor.status_watch()
    }

    /// Disconnect and stop every stage.
    pub async fn shutdown(self) {
        if let Err(e) = self.connection.disconnect().await {
            debug!("disconnect during shutdown: {e}");
        }
        for task in self.tasks {
            task.abort();
        }
        info!("Sentry pipeline stopped");
    }

    async fn persist(&self, settings: &HubSettings) {
        if let Some(path) = &self.settings_path {
            if let Err(e) = save_settings(path, settings).await {
                warn!("Failed to save settings: {e}");
            }
        }
    }
}

fn forward<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    callback: impl Fn(T) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => callback(item),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("subscriber lagged {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
