use sentry_types::ConnectionState;
use thiserror::Error;

use crate::lifecycle::Rejection;
use crate::radio::RadioError;
use crate::transport::TransportError;

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("radio permission not granted")]
    PermissionDenied,
    #[error("radio adapter is disabled")]
    RadioDisabled,
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("connection busy ({0})")]
    Busy(ConnectionState),
    #[error("already connected")]
    AlreadyConnected,
    #[error("link failure: {0}")]
    Link(String),
    #[error("pipeline has shut down")]
    Closed,
}

impl From<TransportError> for HubError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Radio(RadioError::Unauthorized) => HubError::PermissionDenied,
            TransportError::Radio(RadioError::PoweredOff) => HubError::RadioDisabled,
            TransportError::ScanInProgress => HubError::ScanInProgress,
            other => HubError::Link(other.to_string()),
        }
    }
}

impl From<Rejection> for HubError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::Busy => HubError::Busy(ConnectionState::Connecting),
            Rejection::AlreadyConnected => HubError::AlreadyConnected,
        }
    }
}
