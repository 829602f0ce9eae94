/// Errors that can occur talking to the messaging client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Setting up the connection failed before any session event fired.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The session is gone or was never established.
    #[error("not connected")]
    NotConnected,

    /// Sending a message, receipt, or presence update failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The client's key-value credential interface failed.
    #[error("key store: {0}")]
    KeyStore(String),

    /// The event stream closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}
