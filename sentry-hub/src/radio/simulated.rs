//! In-memory radio with scriptable faults.
//!
//! Messages pushed with [`SimulatedRadio::send_message`] are cut to the
//! negotiated MTU and base64-encoded the way a real stack delivers them, so
//! everything above the [`Radio`] seam runs unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sentry_types::{Channel, ATT_HEADER_LEN, DEFAULT_ATT_MTU, SERVICE_UUID};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{AdapterState, Advertisement, LinkDrop, Radio, RadioError};

const NOTIFY_QUEUE: usize = 256;

struct Peripheral {
    name: Option<String>,
    rssi: i16,
    services: Vec<String>,
    channels: Vec<Channel>,
    reachable: bool,
    values: HashMap<Channel, Vec<u8>>,
}

struct SimState {
    adapter: AdapterState,
    devices: BTreeMap<String, Peripheral>,
    connected: Option<String>,
    /// Largest MTU the peripheral accepts; `None` rejects the exchange.
    mtu_limit: Option<u16>,
    mtu: u16,
    failing_connects: u32,
    connect_attempts: u32,
    connect_delay: Option<Duration>,
    scan: Option<mpsc::Sender<Advertisement>>,
    subscriptions: HashMap<Channel, mpsc::Sender<String>>,
}

pub struct SimulatedRadio {
    state: Mutex<SimState>,
    drops: broadcast::Sender<LinkDrop>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    pub fn new() -> Self {
        let (drops, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SimState {
                adapter: AdapterState::PoweredOn,
                devices: BTreeMap::new(),
                connected: None,
                mtu_limit: Some(185),
                mtu: DEFAULT_ATT_MTU,
                failing_connects: 0,
                connect_attempts: 0,
                connect_delay: None,
                scan: None,
                subscriptions: HashMap::new(),
            }),
            drops,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // a poisoned lock only means a test panicked mid-call; the state is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scripting ─────────────────────────────────────────────────────────────

    /// A wearable advertising the Sentry service with both channels.
    pub fn add_wearable(&self, device_id: &str, name: &str, rssi: i16) {
        self.add_device(
            device_id,
            Some(name),
            rssi,
            vec![SERVICE_UUID.to_string()],
            Channel::ALL.to_vec(),
        );
    }

    pub fn add_device(
        &self,
        device_id: &str,
        name: Option<&str>,
        rssi: i16,
        services: Vec<String>,
        channels: Vec<Channel>,
    ) {
        let peripheral = Peripheral {
            name: name.map(str::to_string),
            rssi,
            services,
            channels,
            reachable: true,
            values: HashMap::new(),
        };
        let advert = advertisement(device_id, &peripheral);
        let mut s = self.lock();
        s.devices.insert(device_id.to_string(), peripheral);
        if let Some(scan) = &s.scan {
            let _ = scan.try_send(advert);
        }
    }

    /// Re-advertise a known device, e.g. with a new RSSI.
    pub fn advertise(&self, device_id: &str, rssi: i16) {
        let mut s = self.lock();
        let Some(p) = s.devices.get_mut(device_id) else { return };
        p.rssi = rssi;
        let advert = advertisement(device_id, p);
        if let Some(scan) = &s.scan {
            let _ = scan.try_send(advert);
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.lock().adapter = state;
    }

    pub fn set_reachable(&self, device_id: &str, reachable: bool) {
        if let Some(p) = self.lock().devices.get_mut(device_id) {
            p.reachable = reachable;
        }
    }

    /// The next `n` link attempts fail with a transient link error.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Every link attempt takes this long before answering.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    pub fn set_mtu_limit(&self, limit: Option<u16>) {
        self.lock().mtu_limit = limit;
    }

    /// Value returned by the initial read of `channel`.
    pub fn set_readable(&self, device_id: &str, channel: Channel, json: &str) {
        if let Some(p) = self.lock().devices.get_mut(device_id) {
            p.values.insert(channel, json.as_bytes().to_vec());
        }
    }

    /// Deliver `json` on `channel`, fragmented to the negotiated MTU.
    /// Returns the number of fragments queued.
    pub fn send_message(&self, device_id: &str, channel: Channel, json: &str) -> usize {
        let chunk = usize::from(self.lock().mtu.saturating_sub(ATT_HEADER_LEN).max(1));
        json.as_bytes()
            .chunks(chunk)
            .filter(|piece| self.push_fragment(device_id, channel, piece))
            .count()
    }

    /// Deliver one raw fragment. Returns false when nobody is subscribed.
    pub fn push_fragment(&self, device_id: &str, channel: Channel, bytes: &[u8]) -> bool {
        let s = self.lock();
        if s.connected.as_deref() != Some(device_id) {
            return false;
        }
        match s.subscriptions.get(&channel) {
            Some(tx) => tx.try_send(STANDARD.encode(bytes)).is_ok(),
            None => false,
        }
    }

    /// Lose the link as if the wearable walked out of range.
    pub fn drop_link(&self, device_id: &str, error: Option<&str>) {
        {
            let mut s = self.lock();
            if s.connected.as_deref() != Some(device_id) {
                return;
            }
            s.connected = None;
            s.subscriptions.clear();
            s.mtu = DEFAULT_ATT_MTU;
        }
        debug!("sim: link to {device_id} dropped");
        let _ = self.drops.send(LinkDrop {
            device_id: device_id.to_string(),
            error: error.map(str::to_string),
        });
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock().connected.as_deref() == Some(device_id)
    }

    pub fn mtu(&self) -> u16 {
        self.lock().mtu
    }

    pub fn subscribed(&self, channel: Channel) -> bool {
        self.lock().subscriptions.contains_key(&channel)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    fn require_link(s: &SimState, device_id: &str) -> Result<(), RadioError> {
        if s.adapter != AdapterState::PoweredOn {
            return Err(RadioError::PoweredOff);
        }
        if s.connected.as_deref() != Some(device_id) {
            return Err(RadioError::NotConnected(device_id.to_string()));
        }
        Ok(())
    }
}

fn advertisement(device_id: &str, p: &Peripheral) -> Advertisement {
    Advertisement {
        device_id: device_id.to_string(),
        name: p.name.clone(),
        rssi: p.rssi,
        services: p.services.clone(),
    }
}

fn adapter_error(state: AdapterState) -> Option<RadioError> {
    match state {
        AdapterState::PoweredOn => None,
        AdapterState::Unauthorized => Some(RadioError::Unauthorized),
        AdapterState::PoweredOff | AdapterState::Unknown => Some(RadioError::PoweredOff),
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn adapter_state(&self) -> AdapterState {
        self.lock().adapter
    }

    async fn start_scan(&self, _service_uuid: &str) -> Result<mpsc::Receiver<Advertisement>, RadioError> {
        let mut s = self.lock();
        if let Some(e) = adapter_error(s.adapter) {
            return Err(e);
        }
        let (tx, rx) = mpsc::channel(64);
        for (id, p) in s.devices.iter().filter(|(_, p)| p.reachable) {
            let _ = tx.try_send(advertisement(id, p));
        }
        s.scan = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.lock().scan = None;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), RadioError> {
        let delay = {
            let mut s = self.lock();
            if let Some(e) = adapter_error(s.adapter) {
                return Err(e);
            }
            s.connect_attempts += 1;
            s.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.lock();
        if s.failing_connects > 0 {
            s.failing_connects -= 1;
            return Err(RadioError::Link("connection attempt failed".into()));
        }
        match s.devices.get(device_id) {
            None => Err(RadioError::DeviceNotFound(device_id.to_string())),
            Some(p) if !p.reachable => Err(RadioError::Link(format!("{device_id} out of range"))),
            Some(_) => {
                s.connected = Some(device_id.to_string());
                s.mtu = DEFAULT_ATT_MTU;
                Ok(())
            }
        }
    }

    async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, RadioError> {
        let mut s = self.lock();
        Self::require_link(&s, device_id)?;
        match s.mtu_limit {
            Some(limit) => {
                s.mtu = mtu.min(limit).max(DEFAULT_ATT_MTU);
                Ok(s.mtu)
            }
            None => Err(RadioError::Link("MTU exchange rejected".into())),
        }
    }

    async fn discover(&self, device_id: &str) -> Result<Vec<Channel>, RadioError> {
        let s = self.lock();
        Self::require_link(&s, device_id)?;
        Ok(s.devices.get(device_id).map(|p| p.channels.clone()).unwrap_or_default())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        channel: Channel,
    ) -> Result<mpsc::Receiver<String>, RadioError> {
        let mut s = self.lock();
        Self::require_link(&s, device_id)?;
        let offered = s
            .devices
            .get(device_id)
            .map(|p| p.channels.contains(&channel))
            .unwrap_or(false);
        if !offered {
            return Err(RadioError::ChannelUnavailable(channel));
        }
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE);
        s.subscriptions.insert(channel, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, _device_id: &str, channel: Channel) -> Result<(), RadioError> {
        self.lock().subscriptions.remove(&channel);
        Ok(())
    }

    async fn read(&self, device_id: &str, channel: Channel) -> Result<Option<String>, RadioError> {
        let s = self.lock();
        Self::require_link(&s, device_id)?;
        Ok(s.devices
            .get(device_id)
            .and_then(|p| p.values.get(&channel))
            .map(|bytes| STANDARD.encode(bytes)))
    }

    async fn cancel_connection(&self, device_id: &str) -> Result<(), RadioError> {
        let mut s = self.lock();
        if s.connected.as_deref() == Some(device_id) {
            s.connected = None;
            s.subscriptions.clear();
            s.mtu = DEFAULT_ATT_MTU;
        }
        Ok(())
    }

    fn link_drops(&self) -> broadcast::Receiver<LinkDrop> {
        self.drops.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_are_fragmented_to_mtu() {
        let radio = SimulatedRadio::new();
        radio.add_wearable("dev-1", "Sentry-01", -50);
        radio.connect("dev-1").await.unwrap();
        assert_eq!(radio.request_mtu("dev-1", 512).await.unwrap(), 185);
        radio.set_mtu_limit(Some(23));
        radio.request_mtu("dev-1", 512).await.unwrap();

        let mut rx = radio.subscribe("dev-1", Channel::Motion).await.unwrap();
        let msg = r#"{"ax":0.0,"ay":0.0,"az":9.81,"roll":0.0,"pitch":0.0}"#;
        let n = radio.send_message("dev-1", Channel::Motion, msg);
        assert_eq!(n, msg.len().div_ceil(20));

        let mut joined = Vec::new();
        for _ in 0..n {
            let piece = STANDARD.decode(rx.recv().await.unwrap()).unwrap();
            assert!(piece.len() <= 20);
            joined.extend(piece);
        }
        assert_eq!(joined, msg.as_bytes());
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let radio = SimulatedRadio::new();
        radio.add_wearable("dev-1", "Sentry-01", -50);
        radio.fail_next_connects(2);
        assert!(radio.connect("dev-1").await.is_err());
        assert!(radio.connect("dev-1").await.is_err());
        assert!(radio.connect("dev-1").await.is_ok());
        assert_eq!(radio.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_cancel_are_idempotent() {
        let radio = SimulatedRadio::new();
        radio.add_wearable("dev-1", "Sentry-01", -50);
        assert!(radio.unsubscribe("dev-1", Channel::Gps).await.is_ok());
        assert!(radio.cancel_connection("dev-1").await.is_ok());
        assert!(radio.cancel_connection("dev-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_link_reports_and_closes_subscriptions() {
        let radio = SimulatedRadio::new();
        radio.add_wearable("dev-1", "Sentry-01", -50);
        let mut drops = radio.link_drops();
        radio.connect("dev-1").await.unwrap();
        let mut rx = radio.subscribe("dev-1", Channel::Gps).await.unwrap();

        radio.drop_link("dev-1", Some("supervision timeout"));
        let drop = drops.recv().await.unwrap();
        assert_eq!(drop.device_id, "dev-1");
        assert_eq!(drop.error.as_deref(), Some("supervision timeout"));
        assert!(rx.recv().await.is_none());
        assert!(!radio.is_connected("dev-1"));
    }

    #[tokio::test]
    async fn test_powered_off_adapter_refuses() {
        let radio = SimulatedRadio::new();
        radio.set_adapter_state(AdapterState::Unauthorized);
        assert_eq!(radio.start_scan(SERVICE_UUID).await.err(), Some(RadioError::Unauthorized));
        radio.set_adapter_state(AdapterState::PoweredOff);
        assert_eq!(radio.connect("x").await, Err(RadioError::PoweredOff));
    }
}
