//! Messaging client abstraction for linkrelay.
//!
//! linkrelay doesn't speak the messaging network's protocol itself. An
//! underlying client library does that, and this crate describes the
//! narrow surface we need from it:
//!
//! - a [`Connector`] that mints fresh credentials and opens sessions,
//! - a [`Session`] we can send through and close,
//! - a stream of [`ClientEvent`]s per session,
//! - the [`KeyStore`] callback interface the client uses to read and write
//!   its protocol keys.
//!
//! ```text
//! Connector::connect(creds, keys)
//!     │
//!     ├── Session ───────────── send / mark_read / send_presence / close
//!     └── mpsc<ClientEvent> ─── PairingChallenge, Open, Closed,
//!                               CredentialsUpdated, Messages
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default) — [`MemoryConnector`], a scripted in-process client
//!   for tests and local runs.

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "memory")]
mod memory;

pub use error::TransportError;
#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemorySession, Script};

use std::collections::HashMap;
use std::future::Future;

use linkrelay_protocol::{AccountId, BatchKind, InboundMessage, OutboundContent, SentMessage};
use serde_json::Value;
use tokio::sync::mpsc;

/// Capacity of a session's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something the client reports about its session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Pairing is required; the payload is what the user scans.
    PairingChallenge(String),
    /// The socket is (re)negotiating.
    Connecting,
    /// The session is authenticated and live.
    Open { account: AccountId },
    /// The session ended. `status_code` is `None` when the client
    /// couldn't tell why.
    Closed {
        status_code: Option<u16>,
        reason: String,
    },
    /// The full current credential set after a rotation.
    CredentialsUpdated(Value),
    /// A batch of messages.
    Messages {
        messages: Vec<InboundMessage>,
        kind: BatchKind,
    },
}

/// Presence states we advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

/// One protocol-key write. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWrite {
    pub category: String,
    pub id: String,
    pub value: Option<Value>,
}

/// Storage the client calls back into for its protocol keys.
pub trait KeyStore: Send + Sync + 'static {
    /// Reads the given ids of one key category. Missing ids are absent
    /// from the returned map.
    fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, Value>, TransportError>> + Send;

    /// Writes or deletes a batch of keys.
    fn set(&self, writes: Vec<KeyWrite>) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A live session with the messaging network.
pub trait Session: Send + Sync + 'static {
    /// Sends validated content to `target`.
    fn send(
        &self,
        target: &str,
        content: OutboundContent,
    ) -> impl Future<Output = Result<SentMessage, TransportError>> + Send;

    /// Marks a message as read.
    fn mark_read(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_presence(
        &self,
        presence: Presence,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Detaches listeners and closes the socket. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A freshly opened session plus its event stream.
pub struct Connected<S> {
    pub session: S,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Opens sessions against the messaging network.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Generates a brand-new credential set for an unpaired account.
    fn fresh_credentials(&self) -> Value;

    /// Starts a session using `creds` and `keys`.
    ///
    /// Returns `Err(TransportError::Startup)` when setup fails before the
    /// session produces any event.
    fn connect<K: KeyStore + Clone>(
        &self,
        creds: Value,
        keys: K,
    ) -> impl Future<Output = Result<Connected<Self::Session>, TransportError>> + Send;
}
