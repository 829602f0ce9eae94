//! Outbound delivery for linkrelay.
//!
//! Two pieces, both about getting data out without letting one failure
//! take down the next:
//!
//! - [`DeliveryQueue`] — single-worker FIFO with a pacing delay between
//!   jobs, used for every outbound send so the session is never flooded.
//! - [`WebhookDispatcher`] — fans inbound message payloads out to every
//!   configured endpoint, each retried independently.
//!
//! # How it fits in the stack
//!
//! ```text
//! Relay::send ──→ DeliveryQueue ──→ Session::send
//! Relay inbound loop ──→ WebhookDispatcher ──→ HTTP POST × endpoints
//! ```

#![allow(async_fn_in_trait)]

mod error;
mod queue;
mod webhook;

pub use error::{QueueError, WebhookError};
pub use queue::{DeliveryQueue, QueueConfig, QueueStats};
pub use webhook::{
    DispatchReport, EndpointOutcome, HttpWebhookSender, USER_AGENT, WebhookConfig,
    WebhookDispatcher, WebhookSender,
};
