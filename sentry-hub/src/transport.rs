//! # transport
//!
//! Owns the radio session with one wearable.
//!
//! ## Architecture
//! A connect runs the GATT sequence once per attempt, every phase bounded by
//! the per-attempt timeout:
//!   1. link
//!   2. MTU exchange (best-effort; a failure falls back to the default MTU)
//!   3. discovery of the motion and GPS channels
//!   4. notification subscription on both
//!   5. one initial read per channel
//!
//! The result is a [`Session`] holding the subscriptions. Nothing flows until
//! [`TransportAdapter::activate`] installs it, which spawns one pump task per
//! channel (fragment → [`ReassemblyBuffer`] → schema → telemetry channel) and a
//! watcher for unexpected link loss.
//!
//! ## Invariants
//! - At most one active session; activating a new one tears down the old
//! - Each channel has its own buffer; a corrupt motion buffer never touches GPS
//! - Readings of one channel reach the telemetry channel in arrival order
//! - After an explicit disconnect the watcher stays silent

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use sentry_types::schema::{self, Telemetry};
use sentry_types::{Channel, DeviceDescriptor, DEFAULT_ATT_MTU, DEVICE_NAME_PATTERN, SERVICE_UUID};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::lifecycle::exponential_backoff;
use crate::radio::{AdapterState, Advertisement, LinkDrop, Radio, RadioError};
use crate::reassembly::{ReassemblyBuffer, StaleTicket};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Link attempts per manual connect (default 3)
    pub connect_attempts: u32,
    /// Bound on each connect phase (default 10 s)
    pub attempt_timeout: Duration,
    /// Backoff before the second attempt; doubles per attempt (default 500 ms)
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// MTU asked for during the exchange (default 512)
    pub requested_mtu: u16,
    /// Partial messages older than this are discarded (default 6 s, 3× the send interval)
    pub stale_after: Duration,
    /// Per-channel bound on a message being reassembled (default 4096 bytes)
    pub max_message_len: usize,
    /// Telemetry queue depth towards distribution
    pub telemetry_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
            requested_mtu: 512,
            stale_after: Duration::from_secs(6),
            max_message_len: 4096,
            telemetry_queue: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("a scan is already running")]
    ScanInProgress,
    #[error("{phase} timed out after {timeout:?}")]
    Timeout { phase: &'static str, timeout: Duration },
    #[error("gave up on {device_id} after {attempts} attempts: {last}")]
    ConnectExhausted { device_id: String, attempts: u32, last: String },
    #[error(transparent)]
    Radio(#[from] RadioError),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Radio(e) => e.is_permanent(),
            _ => false,
        }
    }
}

/// Reported to the lifecycle manager when a link drops without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLost {
    pub device_id: String,
    pub error: Option<String>,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// A fully subscribed link that is not yet delivering telemetry.
pub struct Session {
    device_id: String,
    mtu: u16,
    feeds: Vec<(Channel, mpsc::Receiver<String>)>,
    initial: Vec<Telemetry>,
    drops: broadcast::Receiver<LinkDrop>,
}

impl Session {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }
}

struct ActiveSession {
    device_id: String,
    closing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct TransportAdapter {
    radio: Arc<dyn Radio>,
    config: TransportConfig,
    scanning: AtomicBool,
    session: Mutex<Option<ActiveSession>>,
    telemetry_tx: mpsc::Sender<Telemetry>,
    link_tx: mpsc::Sender<LinkLost>,
}

impl TransportAdapter {
    /// Returns the adapter plus the receivers for parsed telemetry and link-loss reports.
    pub fn new(
        radio: Arc<dyn Radio>,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<Telemetry>, mpsc::Receiver<LinkLost>) {
        let (telemetry_tx, telemetry_rx) = mpsc::channel(config.telemetry_queue.max(1));
        let (link_tx, link_rx) = mpsc::channel(8);
        let adapter = Self {
            radio,
            config,
            scanning: AtomicBool::new(false),
            session: Mutex::new(None),
            telemetry_tx,
            link_tx,
        };
        (adapter, telemetry_rx, link_rx)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn current_device(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.device_id.clone())
    }

    async fn ensure_ready(&self) -> Result<(), TransportError> {
        match self.radio.adapter_state().await {
            AdapterState::PoweredOn => Ok(()),
            AdapterState::Unauthorized => Err(RadioError::Unauthorized.into()),
            AdapterState::PoweredOff | AdapterState::Unknown => Err(RadioError::PoweredOff.into()),
        }
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Collect Sentry wearables heard within `duration`, strongest first.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ScanInProgress);
        }
        let _guard = ScanGuard(&self.scanning);
        self.ensure_ready().await?;

        let deadline = Instant::now() + duration;
        let mut adverts = self.radio.start_scan(SERVICE_UUID).await?;
        let mut found: HashMap<String, DeviceDescriptor> = HashMap::new();

        while let Ok(Some(advert)) = timeout_at(deadline, adverts.recv()).await {
            if !is_sentry(&advert) {
                continue;
            }
            let entry = found.entry(advert.device_id.clone()).or_insert_with(|| DeviceDescriptor {
                id: advert.device_id.clone(),
                name: None,
                rssi: advert.rssi,
                connected: false,
            });
            entry.rssi = advert.rssi;
            if advert.name.is_some() {
                entry.name = advert.name;
            }
        }

        if let Err(e) = self.radio.stop_scan().await {
            debug!("stop scan: {e}");
        }

        let connected = self.current_device().await;
        let mut devices: Vec<DeviceDescriptor> = found
            .into_values()
            .map(|mut d| {
                d.connected = connected.as_deref() == Some(d.id.as_str());
                d
            })
            .collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        info!("🔍 Scan finished: {} Sentry device(s)", devices.len());
        Ok(devices)
    }

    // ── Connect ───────────────────────────────────────────────────────────────

    /// Connect and start delivering telemetry. `true` once both channels are live.
    pub async fn connect(&self, device_id: &str, max_attempts: u32, attempt_timeout: Duration) -> bool {
        match self.open_session(device_id, max_attempts, attempt_timeout).await {
            Ok(session) => {
                self.activate(session).await;
                true
            }
            Err(e) => {
                warn!("connect to {device_id} failed: {e}");
                false
            }
        }
    }

    /// Run up to `max_attempts` full connect sequences with exponential backoff
    /// between them. Power/permission errors end the loop immediately.
    pub async fn open_session(
        &self,
        device_id: &str,
        max_attempts: u32,
        attempt_timeout: Duration,
    ) -> Result<Session, TransportError> {
        self.ensure_ready().await?;
        let attempts = max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = exponential_backoff(self.config.backoff_base, self.config.backoff_max, attempt - 1);
                debug!("retrying {device_id} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            info!("🔗 Connecting to {device_id} (attempt {attempt}/{attempts})");

            match self.establish(device_id, attempt_timeout).await {
                Ok(session) => {
                    info!("✅ {device_id} subscribed (MTU {})", session.mtu);
                    return Ok(session);
                }
                Err(e) => {
                    self.release(device_id).await;
                    if e.is_permanent() {
                        return Err(e);
                    }
                    warn!("attempt {attempt}/{attempts} to {device_id} failed: {e}");
                    last = e.to_string();
                }
            }
        }

        Err(TransportError::ConnectExhausted {
            device_id: device_id.to_string(),
            attempts,
            last,
        })
    }

    async fn establish(&self, device_id: &str, limit: Duration) -> Result<Session, TransportError> {
        let drops = self.radio.link_drops();
        bounded("connect", limit, self.radio.connect(device_id)).await?;

        let mtu = match bounded("mtu", limit, self.radio.request_mtu(device_id, self.config.requested_mtu)).await {
            Ok(mtu) => mtu,
            Err(e) => {
                warn!("MTU exchange with {device_id} failed ({e}), staying at {DEFAULT_ATT_MTU}");
                DEFAULT_ATT_MTU
            }
        };

        let offered = bounded("discover", limit, self.radio.discover(device_id)).await?;
        if let Some(missing) = Channel::ALL.into_iter().find(|c| !offered.contains(c)) {
            return Err(RadioError::ChannelUnavailable(missing).into());
        }

        let mut feeds = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let rx = bounded("subscribe", limit, self.radio.subscribe(device_id, channel)).await?;
            feeds.push((channel, rx));
        }

        let mut initial = Vec::new();
        for channel in Channel::ALL {
            match bounded("read", limit, self.radio.read(device_id, channel)).await {
                Ok(Some(value)) => initial.extend(decode_value(channel, device_id, &value)),
                Ok(None) => {}
                Err(e) => debug!("initial {channel} read from {device_id} failed: {e}"),
            }
        }

        Ok(Session {
            device_id: device_id.to_string(),
            mtu,
            feeds,
            initial,
            drops,
        })
    }

    /// Install `session` and start delivering its telemetry.
    pub async fn activate(&self, session: Session) {
        let Session { device_id, feeds, initial, drops, .. } = session;
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            warn!("replacing active session with {}", previous.device_id);
            self.shutdown(previous).await;
        }

        for telemetry in initial {
            if self.telemetry_tx.send(telemetry).await.is_err() {
                debug!("telemetry consumer gone, initial reads from {device_id} dropped");
                break;
            }
        }

        let closing = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(feeds.len() + 1);
        for (channel, notifications) in feeds {
            let buffer = ReassemblyBuffer::new(channel, self.config.stale_after, self.config.max_message_len);
            tasks.push(tokio::spawn(pump(
                device_id.clone(),
                notifications,
                buffer,
                self.telemetry_tx.clone(),
            )));
        }
        tasks.push(tokio::spawn(watch_link(
            device_id.clone(),
            drops,
            closing.clone(),
            self.radio.clone(),
            self.link_tx.clone(),
        )));

        *slot = Some(ActiveSession { device_id, closing, tasks });
    }

    /// Close a session that will never be activated.
    pub async fn discard(&self, session: Session) {
        let device_id = session.device_id.clone();
        drop(session);
        self.release(&device_id).await;
    }

    /// Caller-initiated disconnect: silences the link watcher, stops the pumps,
    /// releases subscriptions and the link. Safe to call with no session.
    pub async fn disconnect(&self) {
        let active = self.session.lock().await.take();
        if let Some(active) = active {
            info!("🔌 Disconnecting {}", active.device_id);
            self.shutdown(active).await;
        }
    }

    /// Unsubscribe both channels and cancel the link, ignoring what is already gone.
    pub async fn release(&self, device_id: &str) {
        for channel in Channel::ALL {
            if let Err(e) = self.radio.unsubscribe(device_id, channel).await {
                debug!("unsubscribe {channel} on {device_id}: {e}");
            }
        }
        if let Err(e) = self.radio.cancel_connection(device_id).await {
            debug!("cancel connection {device_id}: {e}");
        }
    }

    async fn shutdown(&self, active: ActiveSession) {
        active.closing.store(true, Ordering::SeqCst);
        let device_id = active.device_id.clone();
        drop(active);
        self.release(&device_id).await;
    }
}

fn is_sentry(advert: &Advertisement) -> bool {
    advert
        .name
        .as_deref()
        .map_or(false, |n| n.contains(DEVICE_NAME_PATTERN))
        || advert.services.iter().any(|s| s.eq_ignore_ascii_case(SERVICE_UUID))
}

async fn bounded<T>(
    phase: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, RadioError>>,
) -> Result<T, TransportError> {
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout { phase, timeout: limit }),
    }
}

/// A characteristic read returns the whole value at once, so it bypasses reassembly.
fn decode_value(channel: Channel, device_id: &str, encoded: &str) -> Option<Telemetry> {
    let bytes = STANDARD.decode(encoded.as_bytes()).ok()?;
    let doc: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match schema::decode(channel, &doc, device_id, Utc::now()) {
        Ok(t) => Some(t),
        Err(e) => {
            debug!("initial {channel} value rejected: {e}");
            None
        }
    }
}

// ── Session tasks ─────────────────────────────────────────────────────────────

async fn pump(
    device_id: String,
    mut notifications: mpsc::Receiver<String>,
    mut buffer: ReassemblyBuffer,
    telemetry: mpsc::Sender<Telemetry>,
) {
    let channel = buffer.channel();
    loop {
        let ticket = buffer.stale_ticket();
        tokio::select! {
            fragment = notifications.recv() => {
                let Some(encoded) = fragment else {
                    debug!("{channel} notifications from {device_id} closed");
                    return;
                };
                let bytes = match STANDARD.decode(encoded.as_bytes()) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{channel} fragment is not base64 ({e}), dropping partial message");
                        buffer.clear();
                        continue;
                    }
                };
                let Some(doc) = buffer.ingest(&bytes, Instant::now()) else { continue };
                match schema::decode(channel, &doc, &device_id, Utc::now()) {
                    Ok(t) => {
                        if telemetry.send(t).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("{channel} message rejected: {e}"),
                }
            }
            _ = stale_timer(ticket) => {
                if let Some(ticket) = ticket {
                    buffer.expire(ticket);
                }
            }
        }
    }
}

async fn stale_timer(ticket: Option<StaleTicket>) {
    match ticket {
        Some(t) => tokio::time::sleep_until(t.deadline).await,
        None => std::future::pending().await,
    }
}

async fn watch_link(
    device_id: String,
    mut drops: broadcast::Receiver<LinkDrop>,
    closing: Arc<AtomicBool>,
    radio: Arc<dyn Radio>,
    link_tx: mpsc::Sender<LinkLost>,
) {
    let drop = loop {
        match drops.recv().await {
            Ok(d) if d.device_id == device_id => break d,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("link watcher lagged {n} reports");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    };
    if closing.load(Ordering::SeqCst) {
        return;
    }

    warn!(
        "⚠️ Link to {device_id} lost unexpectedly{}",
        drop.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
    );
    for channel in Channel::ALL {
        if let Err(e) = radio.unsubscribe(&device_id, channel).await {
            debug!("unsubscribe {channel} after link loss: {e}");
        }
    }
    let _ = link_tx
        .send(LinkLost { device_id, error: drop.error })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::simulated::SimulatedRadio;

    const MOTION: &str = r#"{"type":"sensor_data","sequence":1,"sensor":{"ax":0.0,"ay":0.0,"az":9.81,"roll":1.0,"pitch":2.0,"tilt_detected":false}}"#;
    const GPS: &str = r#"{"type":"gps_data","gps":{"fix":true,"satellites":7,"latitude":52.52,"longitude":13.40,"altitude":34.0}}"#;

    fn setup() -> (Arc<SimulatedRadio>, TransportAdapter, mpsc::Receiver<Telemetry>, mpsc::Receiver<LinkLost>) {
        let radio = Arc::new(SimulatedRadio::new());
        radio.add_wearable("dev-1", "Sentry-01", -60);
        let (adapter, telemetry, links) = TransportAdapter::new(radio.clone(), TransportConfig::default());
        (radio, adapter, telemetry, links)
    }

    #[tokio::test]
    async fn test_scan_filters_and_dedupes() {
        let (radio, adapter, _t, _l) = setup();
        radio.add_device("tv", Some("Living Room TV"), -30, vec![], vec![]);
        radio.add_device("anon", None, -80, vec![SERVICE_UUID.to_uppercase()], Channel::ALL.to_vec());
        radio.add_wearable("dev-2", "Sentry-02", -45);

        let scan = adapter.scan(Duration::from_millis(200));
        let nudge = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            radio.advertise("dev-1", -40);
        };
        let (devices, ()) = tokio::join!(scan, nudge);
        let devices = devices.unwrap();

        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["dev-1", "dev-2", "anon"]);
        assert_eq!(devices[0].rssi, -40);
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_second_scan_is_refused() {
        let (_radio, adapter, _t, _l) = setup();
        let first = adapter.scan(Duration::from_millis(100));
        let second = async {
            tokio::task::yield_now().await;
            adapter.scan(Duration::from_millis(10)).await
        };
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok());
        assert_eq!(b.unwrap_err(), TransportError::ScanInProgress);
        assert!(adapter.scan(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_delivers_initial_read_then_notifications() {
        let (radio, adapter, mut telemetry, _l) = setup();
        radio.set_readable("dev-1", Channel::Gps, GPS);
        assert!(adapter.connect("dev-1", 3, Duration::from_secs(1)).await);
        assert_eq!(radio.mtu(), 185);

        match telemetry.recv().await.unwrap() {
            Telemetry::Gps(fix) => assert_eq!(fix.satellites, Some(7)),
            other => panic!("expected initial GPS, got {other:?}"),
        }

        radio.send_message("dev-1", Channel::Motion, MOTION);
        match telemetry.recv().await.unwrap() {
            Telemetry::Motion(r) => {
                assert_eq!(r.device_id, "dev-1");
                assert_eq!(r.sequence, Some(1));
            }
            other => panic!("expected motion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mtu_failure_is_not_fatal() {
        let (radio, adapter, mut telemetry, _l) = setup();
        radio.set_mtu_limit(None);
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);
        assert_eq!(radio.mtu(), DEFAULT_ATT_MTU);

        // 20-byte fragments still reassemble
        assert!(radio.send_message("dev-1", Channel::Motion, MOTION) > 5);
        assert!(matches!(telemetry.recv().await, Some(Telemetry::Motion(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let (radio, adapter, _t, _l) = setup();
        radio.fail_next_connects(2);
        let started = Instant::now();
        assert!(adapter.connect("dev-1", 3, Duration::from_secs(1)).await);
        assert_eq!(radio.connect_attempts(), 3);
        // 500 ms + 1 s of backoff
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_tears_down_partial_state() {
        let (radio, adapter, _t, _l) = setup();
        radio.set_connect_delay(Some(Duration::from_secs(5)));
        let err = adapter
            .open_session("dev-1", 2, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectExhausted { attempts: 2, .. }));
        assert!(!radio.is_connected("dev-1"));
        assert!(adapter.current_device().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_channel_fails_attempt() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.add_device("old", Some("Sentry-v1"), -50, vec![], vec![Channel::Motion]);
        let (adapter, _t, _l) = TransportAdapter::new(radio.clone(), TransportConfig::default());
        let err = adapter.open_session("old", 1, Duration::from_secs(1)).await.err().unwrap();
        assert!(err.to_string().contains("gps"));
        assert!(!radio.is_connected("old"));
    }

    #[tokio::test]
    async fn test_permission_error_is_not_retried() {
        let (radio, adapter, _t, _l) = setup();
        radio.set_adapter_state(AdapterState::Unauthorized);
        let err = adapter.open_session("dev-1", 3, Duration::from_secs(1)).await.err().unwrap();
        assert!(err.is_permanent());
        assert_eq!(radio.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_drop_is_reported_and_explicit_is_not() {
        let (radio, adapter, _t, mut links) = setup();
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);
        radio.drop_link("dev-1", Some("supervision timeout"));
        let lost = links.recv().await.unwrap();
        assert_eq!(lost.device_id, "dev-1");
        assert_eq!(lost.error.as_deref(), Some("supervision timeout"));

        adapter.disconnect().await;
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);
        adapter.disconnect().await;
        radio.drop_link("dev-1", None);
        assert!(tokio::time::timeout(Duration::from_millis(100), links.recv()).await.is_err());
        assert!(!radio.subscribed(Channel::Motion));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partial_is_discarded() {
        let (radio, adapter, mut telemetry, _l) = setup();
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);

        // half a message, then silence past the staleness window
        radio.push_fragment("dev-1", Channel::Motion, &MOTION.as_bytes()[..40]);
        tokio::time::sleep(Duration::from_secs(7)).await;

        // a complete message afterwards parses on its own
        radio.send_message("dev-1", Channel::Motion, MOTION);
        assert!(matches!(telemetry.recv().await, Some(Telemetry::Motion(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_tail_does_not_block_following_messages() {
        let (radio, adapter, mut telemetry, _l) = setup();
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);

        radio.push_fragment("dev-1", Channel::Motion, &MOTION.as_bytes()[..40]);
        radio.send_message("dev-1", Channel::Motion, MOTION);
        let next = tokio::time::timeout(Duration::from_secs(1), telemetry.recv()).await;
        assert!(matches!(next, Ok(Some(Telemetry::Motion(_)))));
    }

    #[tokio::test]
    async fn test_activate_without_consumer_still_installs_session() {
        let (radio, adapter, telemetry, _l) = setup();
        drop(telemetry);
        radio.set_readable("dev-1", Channel::Gps, GPS);
        radio.set_readable("dev-1", Channel::Motion, MOTION);
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);
        assert_eq!(adapter.current_device().await.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_corrupt_motion_does_not_disturb_gps() {
        let (radio, adapter, mut telemetry, _l) = setup();
        assert!(adapter.connect("dev-1", 1, Duration::from_secs(1)).await);

        let gps = GPS.as_bytes();
        radio.push_fragment("dev-1", Channel::Gps, &gps[..30]);
        radio.push_fragment("dev-1", Channel::Motion, b"}}garbage");
        radio.push_fragment("dev-1", Channel::Gps, &gps[30..]);

        assert!(matches!(telemetry.recv().await, Some(Telemetry::Gps(_))));
    }
}
