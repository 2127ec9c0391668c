//! # bridge
//!
//! Datagram protocol between the hub and a radio gateway.
//!
//! The gateway owns the physical radio. The hub sends it one [`BridgeCommand`]
//! per UDP datagram and receives [`BridgeFrame`]s back: advertisements while
//! scanning, replies correlated by `request_id`, raw notification fragments
//! (base64, at most MTU - 3 bytes before encoding) and link-loss reports.

use serde::{Deserialize, Serialize};

use crate::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeOp {
    AdapterState,
    StartScan,
    StopScan,
    Connect,
    RequestMtu,
    Discover,
    Subscribe,
    Unsubscribe,
    Read,
    Disconnect,
}

/// Hub → gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeCommand {
    pub request_id: u64,
    pub op: BridgeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    /// Service filter for `start_scan`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl BridgeCommand {
    pub fn new(request_id: u64, op: BridgeOp) -> Self {
        Self {
            request_id,
            op,
            device_id: None,
            channel: None,
            mtu: None,
            service: None,
        }
    }

    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }
}

/// Reply to one [`BridgeCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub request_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
    /// Base64 characteristic value for `read`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl BridgeReply {
    pub fn ok(request_id: u64) -> Self {
        Self { request_id, ok: true, ..Default::default() }
    }

    pub fn failed(request_id: u64, error: BridgeErrorCode) -> Self {
        Self { request_id, ok: false, error: Some(error), ..Default::default() }
    }
}

/// Power/permission state of the gateway's radio adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unknown,
}

/// Failure classes a gateway can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeErrorCode {
    PoweredOff,
    Unauthorized,
    DeviceNotFound,
    NotConnected,
    ChannelUnavailable,
    Busy,
    Link,
}

/// Gateway → hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeFrame {
    Advertisement {
        device_id: String,
        #[serde(default)]
        name: Option<String>,
        rssi: i16,
        #[serde(default)]
        services: Vec<String>,
    },
    Reply(BridgeReply),
    Notification {
        device_id: String,
        channel: Channel,
        payload: String,
    },
    Disconnected {
        device_id: String,
        #[serde(default)]
        error: Option<String>,
    },
}
