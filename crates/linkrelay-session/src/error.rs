//! Error types for the session layer.

use linkrelay_store::StoreError;
use linkrelay_transport::TransportError;

/// Errors surfaced by the connection supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Retries for a bounded disconnect class are exhausted. Nothing will
    /// happen until an explicit reset clears the stored credentials.
    #[error("session is fatal: {0}")]
    Fatal(String),

    /// There is no connected session to act on.
    #[error("not connected")]
    NotConnected,

    /// The supervisor task has stopped.
    #[error("supervisor unavailable")]
    Unavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
