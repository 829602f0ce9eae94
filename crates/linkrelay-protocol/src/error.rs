//! Error types for the protocol layer.
//!
//! Each crate in linkrelay defines its own error enum. A `ProtocolError`
//! always means the problem is in the shape of the data, never in I/O.

/// Errors that can occur while encoding, decoding, or validating data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a value into text).
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The text is not structurally valid JSON.
    ///
    /// This is the "corrupt" case for stored credential blobs: truncated
    /// writes, garbage bytes, or an empty payload.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The JSON parsed, but a tagged binary value inside it could not be
    /// revived (bad base64, out-of-range byte, missing `data`).
    #[error("revive failed at {path}: {reason}")]
    Revive { path: String, reason: String },

    /// The value is well-formed JSON but not acceptable here, for example
    /// an outbound message with neither text nor file.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
