//! # radio
//!
//! The seam between the pipeline and whatever actually talks to the wearable.
//!
//! A [`Radio`] exposes the GATT-style operations the transport needs: scan,
//! link establishment, MTU exchange, channel discovery, notification
//! subscription, one-shot reads and link-loss reports. Notification fragments
//! and read values cross this seam still base64-encoded, exactly as the radio
//! stack hands them over.
//!
//! Implementations:
//!   - [`simulated::SimulatedRadio`]: in-memory and scriptable, for tests and embedders
//!   - [`udp_bridge::UdpBridgeRadio`]: JSON datagrams to a radio gateway process

pub mod simulated;
pub mod udp_bridge;

use async_trait::async_trait;
use sentry_types::bridge::BridgeErrorCode;
use sentry_types::Channel;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use sentry_types::bridge::AdapterState;

/// A device heard while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub device_id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<String>,
}

/// The radio lost a link it did not close on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDrop {
    pub device_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio adapter is powered off")]
    PoweredOff,
    #[error("radio permission not granted")]
    Unauthorized,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("{0} channel not offered by device")]
    ChannelUnavailable(Channel),
    #[error("radio busy")]
    Busy,
    #[error("link error: {0}")]
    Link(String),
    #[error("radio did not answer in time")]
    Timeout,
    #[error("radio I/O: {0}")]
    Io(String),
}

impl RadioError {
    /// Errors that need the user to act (power, permission); retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RadioError::PoweredOff | RadioError::Unauthorized)
    }

    pub fn from_code(code: BridgeErrorCode, device_id: Option<&str>, channel: Option<Channel>) -> Self {
        let device = device_id.unwrap_or("?").to_string();
        match code {
            BridgeErrorCode::PoweredOff => RadioError::PoweredOff,
            BridgeErrorCode::Unauthorized => RadioError::Unauthorized,
            BridgeErrorCode::DeviceNotFound => RadioError::DeviceNotFound(device),
            BridgeErrorCode::NotConnected => RadioError::NotConnected(device),
            BridgeErrorCode::ChannelUnavailable => {
                RadioError::ChannelUnavailable(channel.unwrap_or(Channel::Motion))
            }
            BridgeErrorCode::Busy => RadioError::Busy,
            BridgeErrorCode::Link => RadioError::Link(format!("gateway reported link failure for {device}")),
        }
    }
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    async fn adapter_state(&self) -> AdapterState;

    /// Start discovery. Advertisements arrive on the returned receiver until
    /// [`Radio::stop_scan`]; the caller does the filtering.
    async fn start_scan(&self, service_uuid: &str) -> Result<mpsc::Receiver<Advertisement>, RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, device_id: &str) -> Result<(), RadioError>;

    /// Returns the MTU actually agreed, which may be lower than requested.
    async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, RadioError>;

    async fn discover(&self, device_id: &str) -> Result<Vec<Channel>, RadioError>;

    /// Base64 notification fragments for `channel`, in arrival order.
    async fn subscribe(
        &self,
        device_id: &str,
        channel: Channel,
    ) -> Result<mpsc::Receiver<String>, RadioError>;

    /// Must succeed when the subscription is already gone.
    async fn unsubscribe(&self, device_id: &str, channel: Channel) -> Result<(), RadioError>;

    /// Current characteristic value, base64, if the device has one.
    async fn read(&self, device_id: &str, channel: Channel) -> Result<Option<String>, RadioError>;

    /// Must succeed when no link exists.
    async fn cancel_connection(&self, device_id: &str) -> Result<(), RadioError>;

    fn link_drops(&self) -> broadcast::Receiver<LinkDrop>;
}
