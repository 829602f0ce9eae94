//! # linkrelay
//!
//! Keeps one messaging-network session alive and relays its traffic.
//!
//! The underlying client library speaks the network protocol; linkrelay
//! wraps it with the parts that make it survive production:
//!
//! - a supervised connection that classifies every disconnect and
//!   reconnects on the right schedule, going FATAL only when retrying
//!   cannot help,
//! - credentials persisted to a remote key-value service with per-key
//!   write serialization, backups, and self-healing reads,
//! - a paced outbound queue,
//! - inbound message records and webhook fan-out with per-endpoint retries.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use linkrelay::prelude::*;
//!
//! let config = RelayConfig::load();
//! linkrelay::logging::init(&config.log_level)?;
//! let relay = linkrelay::spawn_with_postgrest(&config, Arc::new(my_connector))?;
//! relay.start().await?;
//! relay.send(&OutboundMessage::text("15551234567@s.whatsapp.net", "hi")).await?;
//! ```

#![allow(async_fn_in_trait)]

mod archive;
mod config;
mod error;
pub mod logging;
mod relay;
mod sink;

pub use archive::{MediaArchive, NoArchive};
pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::{PostgrestRelay, Relay, RelayBuilder, RelayParts, spawn_with_postgrest};
pub use sink::{MemoryMessageSink, MessageSink, PostgrestRows};

pub use linkrelay_delivery as delivery;
pub use linkrelay_protocol as protocol;
pub use linkrelay_retry as retry;
pub use linkrelay_session as session;
pub use linkrelay_store as store;
pub use linkrelay_transport as transport;

/// The types most embedders need.
pub mod prelude {
    pub use crate::{MediaArchive, MessageSink, Relay, RelayBuilder, RelayConfig, RelayError};
    pub use linkrelay_protocol::{OutboundMessage, SentMessage};
    pub use linkrelay_session::{ConnectionState, SupervisorStatus};
    pub use linkrelay_transport::{Connector, Session};
}
