//! Media archiving hook.
//!
//! Inbound media can be copied to long-term storage before the message is
//! recorded. The mechanics live outside this crate; the relay only needs
//! the resulting [`MediaRef`] to attach to the record and webhook payload.

use std::future::Future;

use linkrelay_protocol::{InboundMessage, MediaRef};

use crate::RelayError;

/// Archives the media of an inbound message.
pub trait MediaArchive: Send + Sync + 'static {
    /// Returns the archived reference, or `None` when nothing was kept.
    fn archive(
        &self,
        message: &InboundMessage,
    ) -> impl Future<Output = Result<Option<MediaRef>, RelayError>> + Send;
}

/// Keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArchive;

impl MediaArchive for NoArchive {
    async fn archive(&self, _message: &InboundMessage) -> Result<Option<MediaRef>, RelayError> {
        Ok(None)
    }
}
