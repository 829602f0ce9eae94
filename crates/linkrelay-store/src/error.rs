//! Error types for the store layer.

use linkrelay_protocol::ProtocolError;

/// Errors that can occur reading or writing durable state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The HTTP request itself failed (connect, timeout, body).
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The backing service answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// The value handed to a write is not a storable blob.
    #[error("invalid blob: {0}")]
    InvalidBlob(String),

    /// Encoding or decoding a blob failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The write landed but reading it back didn't produce a valid blob.
    #[error("write verification failed: {0}")]
    Verification(String),

    /// Every write attempt failed. Partial writes are not rolled back.
    #[error("write of {key} failed after {attempts} attempt(s): {source}")]
    WriteFailed {
        key: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    /// The client could not be configured (bad header value, TLS setup).
    #[error("configuration: {0}")]
    Config(String),
}
