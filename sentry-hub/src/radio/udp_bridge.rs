//! # udp_bridge
//!
//! [`Radio`] backed by a gateway process that owns the physical radio.
//!
//! ## Architecture
//! One UDP socket, one background listener task (tokio::spawn). It:
//!   1. Binds the hub port (default 5560, `SENTRY_BRIDGE_PORT`)
//!   2. Sends each [`BridgeCommand`] as one JSON datagram to the gateway
//!   3. Routes incoming [`BridgeFrame`]s: replies to the waiting request by
//!      `request_id`, advertisements to the active scan, notification
//!      fragments to the matching subscription, disconnects to the link-drop
//!      broadcast
//!
//! ## Invariants
//! - Receive errors and malformed datagrams never stop the listener
//! - A request that times out removes its pending slot, so a late reply is dropped

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sentry_types::bridge::{BridgeCommand, BridgeFrame, BridgeOp, BridgeReply};
use sentry_types::Channel;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AdapterState, Advertisement, LinkDrop, Radio, RadioError};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// UDP port the hub listens on (default 5560)
    pub listen_port: u16,
    /// Gateway address (default 127.0.0.1:5561)
    pub gateway_addr: String,
    /// How long a command waits for its reply (default 3 s)
    pub reply_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_port: std::env::var("SENTRY_BRIDGE_PORT")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(5560),
            gateway_addr: std::env::var("SENTRY_GATEWAY_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:5561".to_string()),
            reply_timeout: Duration::from_millis(
                std::env::var("SENTRY_BRIDGE_REPLY_MS")
                    .ok().and_then(|v| v.parse().ok()).unwrap_or(3000),
            ),
        }
    }
}

// ── Routing table ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<BridgeReply>>,
    scan: Option<mpsc::Sender<Advertisement>>,
    subscriptions: HashMap<(String, Channel), mpsc::Sender<String>>,
}

type SharedRoutes = Arc<Mutex<Routes>>;

fn routes(shared: &SharedRoutes) -> MutexGuard<'_, Routes> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct UdpBridgeRadio {
    socket: Arc<UdpSocket>,
    gateway: SocketAddr,
    reply_timeout: Duration,
    next_request: AtomicU64,
    routes: SharedRoutes,
    drops: broadcast::Sender<LinkDrop>,
    listener: JoinHandle<()>,
}

impl UdpBridgeRadio {
    pub async fn bind(config: &BridgeConfig) -> std::io::Result<Self> {
        let addr = format!("0.0.0.0:{}", config.listen_port);
        let socket = Arc::new(UdpSocket::bind(&addr).await?);
        let gateway = tokio::net::lookup_host(&config.gateway_addr)
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("gateway address {} did not resolve", config.gateway_addr),
                )
            })?;
        info!("📡 Radio bridge listening on UDP {addr}, gateway {gateway}");

        let routes: SharedRoutes = Arc::new(Mutex::new(Routes::default()));
        let (drops, _) = broadcast::channel(16);
        let listener = tokio::spawn(listen(socket.clone(), routes.clone(), drops.clone()));

        Ok(Self {
            socket,
            gateway,
            reply_timeout: config.reply_timeout,
            next_request: AtomicU64::new(1),
            routes,
            drops,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn command(&self, op: BridgeOp) -> BridgeCommand {
        BridgeCommand::new(self.next_request.fetch_add(1, Ordering::Relaxed), op)
    }

    /// Send `cmd` and wait for its reply. A reply with `ok: false` becomes an error.
    async fn request(&self, cmd: BridgeCommand) -> Result<BridgeReply, RadioError> {
        let id = cmd.request_id;
        let (tx, rx) = oneshot::channel();
        routes(&self.routes).pending.insert(id, tx);

        if let Err(e) = self.send(&cmd).await {
            routes(&self.routes).pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) if reply.ok => Ok(reply),
            Ok(Ok(reply)) => Err(match reply.error {
                Some(code) => RadioError::from_code(code, cmd.device_id.as_deref(), cmd.channel),
                None => RadioError::Link(format!("{:?} refused by gateway", cmd.op)),
            }),
            Ok(Err(_)) => Err(RadioError::Io("bridge listener stopped".into())),
            Err(_) => {
                routes(&self.routes).pending.remove(&id);
                debug!("bridge: request {id} ({:?}) timed out", cmd.op);
                Err(RadioError::Timeout)
            }
        }
    }

    async fn send(&self, cmd: &BridgeCommand) -> Result<(), RadioError> {
        let bytes = serde_json::to_vec(cmd).map_err(|e| RadioError::Io(e.to_string()))?;
        self.socket
            .send_to(&bytes, self.gateway)
            .await
            .map(|_| ())
            .map_err(|e| RadioError::Io(e.to_string()))
    }
}

impl Drop for UdpBridgeRadio {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// ── Listener task ─────────────────────────────────────────────────────────────

async fn listen(socket: Arc<UdpSocket>, routes: SharedRoutes, drops: broadcast::Sender<LinkDrop>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => dispatch(&buf[..len], src, &routes, &drops),
            Err(e) => {
                // Never crash: log and continue
                warn!("bridge: UDP recv error: {e}");
            }
        }
    }
}

fn dispatch(data: &[u8], src: SocketAddr, shared: &SharedRoutes, drops: &broadcast::Sender<LinkDrop>) {
    let frame: BridgeFrame = match serde_json::from_slice(data) {
        Ok(f) => f,
        Err(e) => {
            debug!("bridge: malformed frame from {src}: {e}");
            return;
        }
    };

    match frame {
        BridgeFrame::Reply(reply) => {
            let waiter = routes(shared).pending.remove(&reply.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!("bridge: late or unknown reply {}", reply.request_id),
            }
        }
        BridgeFrame::Advertisement { device_id, name, rssi, services } => {
            if let Some(scan) = &routes(shared).scan {
                let _ = scan.try_send(Advertisement { device_id, name, rssi, services });
            }
        }
        BridgeFrame::Notification { device_id, channel, payload } => {
            let r = routes(shared);
            match r.subscriptions.get(&(device_id, channel)) {
                Some(tx) => {
                    if tx.try_send(payload).is_err() {
                        warn!("bridge: {channel} notification queue full, fragment dropped");
                    }
                }
                None => debug!("bridge: unsolicited {channel} notification"),
            }
        }
        BridgeFrame::Disconnected { device_id, error } => {
            routes(shared).subscriptions.retain(|(id, _), _| *id != device_id);
            info!("bridge: gateway reports {device_id} disconnected");
            let _ = drops.send(LinkDrop { device_id, error });
        }
    }
}

// ── Radio impl ────────────────────────────────────────────────────────────────

#[async_trait]
impl Radio for UdpBridgeRadio {
    async fn adapter_state(&self) -> AdapterState {
        match self.request(self.command(BridgeOp::AdapterState)).await {
            Ok(reply) => reply.adapter.unwrap_or(AdapterState::Unknown),
            Err(RadioError::PoweredOff) => AdapterState::PoweredOff,
            Err(RadioError::Unauthorized) => AdapterState::Unauthorized,
            Err(e) => {
                warn!("bridge: adapter state unavailable: {e}");
                AdapterState::Unknown
            }
        }
    }

    async fn start_scan(&self, service_uuid: &str) -> Result<mpsc::Receiver<Advertisement>, RadioError> {
        let (tx, rx) = mpsc::channel(64);
        routes(&self.routes).scan = Some(tx);
        if let Err(e) = self.request(self.command(BridgeOp::StartScan).service(service_uuid)).await {
            routes(&self.routes).scan = None;
            return Err(e);
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        routes(&self.routes).scan = None;
        self.request(self.command(BridgeOp::StopScan)).await.map(|_| ())
    }

    async fn connect(&self, device_id: &str) -> Result<(), RadioError> {
        self.request(self.command(BridgeOp::Connect).device(device_id)).await.map(|_| ())
    }

    async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, RadioError> {
        let reply = self
            .request(self.command(BridgeOp::RequestMtu).device(device_id).mtu(mtu))
            .await?;
        Ok(reply.mtu.unwrap_or(sentry_types::DEFAULT_ATT_MTU))
    }

    async fn discover(&self, device_id: &str) -> Result<Vec<Channel>, RadioError> {
        let reply = self.request(self.command(BridgeOp::Discover).device(device_id)).await?;
        Ok(reply.channels)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        channel: Channel,
    ) -> Result<mpsc::Receiver<String>, RadioError> {
        let key = (device_id.to_string(), channel);
        let (tx, rx) = mpsc::channel(256);
        // route first so no fragment sent right after the reply is lost
        routes(&self.routes).subscriptions.insert(key.clone(), tx);
        let cmd = self.command(BridgeOp::Subscribe).device(device_id).channel(channel);
        if let Err(e) = self.request(cmd).await {
            routes(&self.routes).subscriptions.remove(&key);
            return Err(e);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, device_id: &str, channel: Channel) -> Result<(), RadioError> {
        let removed = routes(&self.routes)
            .subscriptions
            .remove(&(device_id.to_string(), channel))
            .is_some();
        if !removed {
            return Ok(());
        }
        let cmd = self.command(BridgeOp::Unsubscribe).device(device_id).channel(channel);
        match self.request(cmd).await {
            Ok(_) | Err(RadioError::NotConnected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, device_id: &str, channel: Channel) -> Result<Option<String>, RadioError> {
        let cmd = self.command(BridgeOp::Read).device(device_id).channel(channel);
        Ok(self.request(cmd).await?.payload)
    }

    async fn cancel_connection(&self, device_id: &str) -> Result<(), RadioError> {
        routes(&self.routes).subscriptions.retain(|(id, _), _| id != device_id);
        match self.request(self.command(BridgeOp::Disconnect).device(device_id)).await {
            Ok(_) | Err(RadioError::NotConnected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn link_drops(&self) -> broadcast::Receiver<LinkDrop> {
        self.drops.subscribe()
    }
}
