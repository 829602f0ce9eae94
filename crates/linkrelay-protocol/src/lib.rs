//! Shared data model for linkrelay.
//!
//! This crate defines the "language" every other layer speaks:
//!
//! - **Types** ([`AccountId`], [`Generation`], [`ConnectionLogEntry`]) —
//!   identity and lifecycle records.
//! - **Messages** ([`InboundMessage`], [`OutboundMessage`]) — what the
//!   messaging session hands us and what callers ask us to send.
//! - **Records** ([`MessageRecord`], [`WebhookPayload`]) — the rows we
//!   persist and the JSON we forward downstream.
//! - **Codec** ([`Codec`] trait, [`BufferJsonCodec`]) — how credential
//!   blobs are turned into text for the key-value store and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (client events) → Protocol (typed records) → Store / Session / Delivery
//! ```
//!
//! Nothing in here performs I/O.

mod codec;
mod error;
mod message;
mod record;
mod types;

pub use codec::{BufferJsonCodec, Codec, buffer_value, value_bytes};
pub use error::ProtocolError;
pub use message::{
    BatchKind, InboundMessage, MAX_OUTBOUND_FILE_BYTES, MediaKind, MessageContent,
    OutboundContent, OutboundMessage, ReplyContext, SentMessage,
};
pub use record::{
    ChatKind, Direction, MediaRef, MessageRecord, ReplyInfo, WebhookPayload, plain_phone,
};
pub use types::{AccountId, ConnectionLogEntry, Generation};
