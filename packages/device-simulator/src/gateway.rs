//! gateway.rs: Radio gateway emulation over the hub's UDP bridge
//!
//! [`VirtualWearable`] answers bridge commands the way a gateway with one
//! Sentry wearable in range would: adapter power/permission, scanning,
//! connect, MTU negotiation, discovery, subscriptions and reads.
//!
//! [`GatewayLink`] owns the UDP socket. Notifications are cut into
//! MTU − 3 byte fragments and base64-encoded, one datagram per fragment.
//! Send errors are logged, never fatal.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use sentry_types::bridge::{
    AdapterState, BridgeCommand, BridgeErrorCode, BridgeFrame, BridgeOp, BridgeReply,
};
use sentry_types::{Channel, ATT_HEADER_LEN, DEFAULT_ATT_MTU, SERVICE_UUID};

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    pub name: String,
    pub rssi: i16,
    /// Largest MTU the wearable's stack will agree to.
    pub max_mtu: u16,
}

// ── Virtual wearable ──────────────────────────────────────────────────────────

pub struct VirtualWearable {
    pub profile: DeviceProfile,
    pub adapter: AdapterState,
    scanning: bool,
    connected: bool,
    mtu: u16,
    subscribed: HashSet<Channel>,
    /// Last full document per channel, served to `read`.
    latest: HashMap<Channel, Vec<u8>>,
}

impl VirtualWearable {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            adapter: AdapterState::PoweredOn,
            scanning: false,
            connected: false,
            mtu: DEFAULT_ATT_MTU,
            subscribed: HashSet::new(),
            latest: HashMap::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.connected && self.subscribed.contains(&channel)
    }

    pub fn handle(&mut self, cmd: &BridgeCommand) -> BridgeReply {
        let id = cmd.request_id;
        if cmd.op == BridgeOp::AdapterState {
            return BridgeReply { adapter: Some(self.adapter), ..BridgeReply::ok(id) };
        }
        match self.adapter {
            AdapterState::PoweredOn => {}
            AdapterState::Unauthorized => return BridgeReply::failed(id, BridgeErrorCode::Unauthorized),
            AdapterState::PoweredOff | AdapterState::Unknown => {
                return BridgeReply::failed(id, BridgeErrorCode::PoweredOff)
            }
        }

        match cmd.op {
            BridgeOp::AdapterState => BridgeReply::ok(id),
            BridgeOp::StartScan => {
                self.scanning = true;
                BridgeReply::ok(id)
            }
            BridgeOp::StopScan => {
                self.scanning = false;
                BridgeReply::ok(id)
            }
            BridgeOp::Connect => {
                if !self.addressed(cmd) {
                    return BridgeReply::failed(id, BridgeErrorCode::DeviceNotFound);
                }
                if !self.connected {
                    self.connected = true;
                    self.mtu = DEFAULT_ATT_MTU;
                    self.subscribed.clear();
                    info!("🔗 {} connected", self.profile.id);
                }
                BridgeReply::ok(id)
            }
            BridgeOp::Disconnect => {
                if !self.addressed(cmd) || !self.connected {
                    return BridgeReply::failed(id, BridgeErrorCode::NotConnected);
                }
                self.drop_connection();
                info!("👋 {} disconnected by hub", self.profile.id);
                BridgeReply::ok(id)
            }
            _ if !self.addressed(cmd) || !self.connected => {
                BridgeReply::failed(id, BridgeErrorCode::NotConnected)
            }
            BridgeOp::RequestMtu => {
                let wanted = cmd.mtu.unwrap_or(DEFAULT_ATT_MTU);
                self.mtu = wanted.min(self.profile.max_mtu).max(DEFAULT_ATT_MTU);
                debug!("MTU negotiated: {}", self.mtu);
                BridgeReply { mtu: Some(self.mtu), ..BridgeReply::ok(id) }
            }
            BridgeOp::Discover => BridgeReply { channels: Channel::ALL.to_vec(), ..BridgeReply::ok(id) },
            BridgeOp::Subscribe => match cmd.channel {
                Some(channel) => {
                    self.subscribed.insert(channel);
                    BridgeReply::ok(id)
                }
                None => BridgeReply::failed(id, BridgeErrorCode::ChannelUnavailable),
            },
            BridgeOp::Unsubscribe => {
                if let Some(channel) = cmd.channel {
                    self.subscribed.remove(&channel);
                }
                BridgeReply::ok(id)
            }
            BridgeOp::Read => match cmd.channel {
                Some(channel) => BridgeReply {
                    payload: self.latest.get(&channel).map(|doc| STANDARD.encode(doc)),
                    ..BridgeReply::ok(id)
                },
                None => BridgeReply::failed(id, BridgeErrorCode::ChannelUnavailable),
            },
        }
    }

    pub fn advertisement(&self) -> BridgeFrame {
        BridgeFrame::Advertisement {
            device_id: self.profile.id.clone(),
            name: Some(self.profile.name.clone()),
            rssi: self.profile.rssi,
            services: vec![SERVICE_UUID.to_string()],
        }
    }

    /// Store `doc` as the channel's current value and return the
    /// notification fragments to send, empty when nobody is subscribed.
    pub fn publish(&mut self, channel: Channel, doc: Vec<u8>) -> Vec<BridgeFrame> {
        let frames = if self.is_subscribed(channel) {
            fragment(&doc, self.payload_limit())
                .map(|chunk| BridgeFrame::Notification {
                    device_id: self.profile.id.clone(),
                    channel,
                    payload: STANDARD.encode(chunk),
                })
                .collect()
        } else {
            Vec::new()
        };
        self.latest.insert(channel, doc);
        frames
    }

    /// Unexpected link loss. Returns the frame to report, if there was a link.
    pub fn link_lost(&mut self, reason: &str) -> Option<BridgeFrame> {
        if !self.connected {
            return None;
        }
        self.drop_connection();
        Some(BridgeFrame::Disconnected {
            device_id: self.profile.id.clone(),
            error: Some(reason.to_string()),
        })
    }

    fn payload_limit(&self) -> usize {
        usize::from(self.mtu.saturating_sub(ATT_HEADER_LEN))
    }

    fn addressed(&self, cmd: &BridgeCommand) -> bool {
        cmd.device_id.as_deref() == Some(self.profile.id.as_str())
    }

    fn drop_connection(&mut self) {
        self.connected = false;
        self.subscribed.clear();
        self.mtu = DEFAULT_ATT_MTU;
    }
}

/// Cut `payload` into chunks of at most `limit` bytes.
pub fn fragment(payload: &[u8], limit: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(limit.max(1))
}

// ── UDP link ──────────────────────────────────────────────────────────────────

pub struct GatewayLink {
    socket: UdpSocket,
    /// Where unsolicited frames go; follows whoever last sent a command.
    hub_addr: RwLock<SocketAddr>,
}

impl GatewayLink {
    pub async fn bind(listen_port: u16, hub_addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(format!("0.0.0.0:{listen_port}")).await?;
        Ok(Self { socket, hub_addr: RwLock::new(hub_addr) })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Next command from the hub. `None` for a datagram that is not a command.
    pub async fn recv_command(&self, buf: &mut [u8]) -> std::io::Result<Option<BridgeCommand>> {
        let (len, peer) = self.socket.recv_from(buf).await?;
        match serde_json::from_slice::<BridgeCommand>(&buf[..len]) {
            Ok(cmd) => {
                if let Ok(mut hub) = self.hub_addr.write() {
                    *hub = peer;
                }
                Ok(Some(cmd))
            }
            Err(e) => {
                warn!("UDP: ignoring malformed command from {peer}: {e}");
                Ok(None)
            }
        }
    }

    pub async fn send(&self, frame: &BridgeFrame) {
        let bytes = match serde_json::to_vec(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("UDP: serialize failed: {e}");
                return;
            }
        };
        let addr = match self.hub_addr.read() {
            Ok(addr) => *addr,
            Err(_) => return,
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!("UDP: send to {addr} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "C4:DE:E2:10:7A:01";

    fn wearable() -> VirtualWearable {
        VirtualWearable::new(DeviceProfile {
            id: ID.into(),
            name: "Sentry-7A01".into(),
            rssi: -58,
            max_mtu: 185,
        })
    }

    fn cmd(op: BridgeOp) -> BridgeCommand {
        BridgeCommand::new(1, op).device(ID)
    }

    fn connected() -> VirtualWearable {
        let mut w = wearable();
        assert!(w.handle(&cmd(BridgeOp::Connect)).ok);
        w
    }

    #[test]
    fn test_fragments_respect_payload_limit() {
        let doc = vec![b'x'; 50];
        let chunks: Vec<_> = fragment(&doc, 20).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 10);
        assert_eq!(chunks.concat(), doc);
        assert_eq!(fragment(b"ab", 0).count(), 2);
    }

    #[test]
    fn test_mtu_is_capped_by_device() {
        let mut w = connected();
        let reply = w.handle(&cmd(BridgeOp::RequestMtu).mtu(512));
        assert_eq!(reply.mtu, Some(185));
        let reply = w.handle(&cmd(BridgeOp::RequestMtu).mtu(10));
        assert_eq!(reply.mtu, Some(DEFAULT_ATT_MTU));
    }

    #[test]
    fn test_publish_fragments_only_subscribed_channels() {
        let mut w = connected();
        w.handle(&cmd(BridgeOp::Subscribe).channel(Channel::Motion));

        let doc = br#"{"type":"sensor_data","sensor":{"ax":0.1,"ay":0.2,"az":9.8}}"#.to_vec();
        let frames = w.publish(Channel::Motion, doc.clone());
        // default MTU 23 leaves 20 bytes per fragment
        assert_eq!(frames.len(), doc.len().div_ceil(20));

        let mut rebuilt = Vec::new();
        for f in &frames {
            match f {
                BridgeFrame::Notification { channel, payload, .. } => {
                    assert_eq!(*channel, Channel::Motion);
                    rebuilt.extend(STANDARD.decode(payload).unwrap());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(rebuilt, doc);

        assert!(w.publish(Channel::Gps, b"{}".to_vec()).is_empty());
    }

    #[test]
    fn test_read_serves_latest_document() {
        let mut w = connected();
        let empty = w.handle(&cmd(BridgeOp::Read).channel(Channel::Gps));
        assert!(empty.ok);
        assert!(empty.payload.is_none());

        w.publish(Channel::Gps, b"{\"fix\":false}".to_vec());
        let reply = w.handle(&cmd(BridgeOp::Read).channel(Channel::Gps));
        assert_eq!(STANDARD.decode(reply.payload.unwrap()).unwrap(), b"{\"fix\":false}");
    }

    #[test]
    fn test_adapter_state_gates_everything_else() {
        let mut w = wearable();
        w.adapter = AdapterState::Unauthorized;
        let state = w.handle(&BridgeCommand::new(1, BridgeOp::AdapterState));
        assert_eq!(state.adapter, Some(AdapterState::Unauthorized));
        assert_eq!(w.handle(&cmd(BridgeOp::Connect)).error, Some(BridgeErrorCode::Unauthorized));

        w.adapter = AdapterState::PoweredOff;
        let scan = w.handle(&BridgeCommand::new(2, BridgeOp::StartScan));
        assert_eq!(scan.error, Some(BridgeErrorCode::PoweredOff));
        assert!(!w.is_scanning());
    }

    #[test]
    fn test_unknown_device_and_missing_link() {
        let mut w = wearable();
        let reply = w.handle(&BridgeCommand::new(1, BridgeOp::Connect).device("00:00"));
        assert_eq!(reply.error, Some(BridgeErrorCode::DeviceNotFound));
        let reply = w.handle(&cmd(BridgeOp::Discover));
        assert_eq!(reply.error, Some(BridgeErrorCode::NotConnected));
        let reply = w.handle(&cmd(BridgeOp::Disconnect));
        assert_eq!(reply.error, Some(BridgeErrorCode::NotConnected));
    }

    #[test]
    fn test_link_loss_clears_subscriptions() {
        let mut w = connected();
        w.handle(&cmd(BridgeOp::Subscribe).channel(Channel::Gps));
        assert!(w.is_subscribed(Channel::Gps));

        match w.link_lost("supervision timeout") {
            Some(BridgeFrame::Disconnected { device_id, error }) => {
                assert_eq!(device_id, ID);
                assert_eq!(error.as_deref(), Some("supervision timeout"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!w.is_subscribed(Channel::Gps));
        assert!(w.link_lost("again").is_none());
    }

    #[tokio::test]
    async fn test_link_answers_the_sender() {
        let hub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let placeholder: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let link = GatewayLink::bind(0, placeholder).await.unwrap();
        let port = link.local_addr().unwrap().port();

        let cmd = serde_json::to_vec(&BridgeCommand::new(5, BridgeOp::AdapterState)).unwrap();
        hub.send_to(&cmd, ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 1024];
        let received = link.recv_command(&mut buf).await.unwrap().unwrap();
        assert_eq!(received.request_id, 5);

        link.send(&BridgeFrame::Reply(BridgeReply::ok(5))).await;
        let (len, _) = hub.recv_from(&mut buf).await.unwrap();
        let frame: BridgeFrame = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(frame, BridgeFrame::Reply(BridgeReply::ok(5)));
    }
}
