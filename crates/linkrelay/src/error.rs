//! Unified error type for linkrelay.

use linkrelay_delivery::{QueueError, WebhookError};
use linkrelay_protocol::ProtocolError;
use linkrelay_session::SessionError;
use linkrelay_store::StoreError;
use linkrelay_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` conversions let `?` lift any layer's error into this one.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid outbound message or undecodable stored data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Not connected, fatal, or the supervisor is gone.
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// The delivery queue dropped or could not run the job.
    #[error("delivery queue: {0}")]
    Queue(String),

    /// Bad or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<QueueError<RelayError>> for RelayError {
    fn from(err: QueueError<RelayError>) -> Self {
        match err {
            QueueError::Task(inner) => inner,
            other => Self::Queue(other.to_string()),
        }
    }
}
