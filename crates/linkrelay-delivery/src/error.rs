//! Error types for the delivery layer.

/// Why a queued task produced no value.
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E> {
    /// The task ran and returned an error.
    #[error("queued task failed: {0}")]
    Task(#[source] E),

    /// The task panicked. The worker survived and moved on.
    #[error("queued task panicked")]
    Panicked,

    /// The worker has stopped, so the task never ran.
    #[error("delivery queue closed")]
    Closed,
}

impl<E> QueueError<E> {
    /// The task's own error, if it got far enough to return one.
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task(e) => Some(e),
            Self::Panicked | Self::Closed => None,
        }
    }
}

/// Errors from posting to a webhook endpoint.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Connection, timeout, or body encoding failure.
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("webhook endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}
