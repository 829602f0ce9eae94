//! Disconnect classification and the reconnect policy.
//!
//! Every disconnect carries an optional numeric status code from the
//! client library. We sort it into one of four classes, and each class
//! maps to a retry rule:
//!
//! | Code(s)            | Class              | Rule                                   |
//! |--------------------|--------------------|----------------------------------------|
//! | 401, 500           | `SessionRejected`  | backoff, up to `rejected_limit`, then FATAL |
//! | 408, 428           | `Transient`        | backoff, unlimited                     |
//! | 515                | `RestartRequired`  | fixed short delay, attempts reset to 0 |
//! | none / anything else | `Unknown`        | backoff, unlimited                     |

use std::fmt;
use std::time::Duration;

use linkrelay_retry::RetryPolicy;
use tracing::warn;

/// Remote logged the session out.
pub const CODE_LOGGED_OUT: u16 = 401;
/// The client rejected the local session data.
pub const CODE_BAD_SESSION: u16 = 500;
/// Connection lost or timed out.
pub const CODE_CONNECTION_LOST: u16 = 408;
pub const CODE_CONNECTION_CLOSED: u16 = 428;
/// Protocol-mandated restart, sent right after pairing completes.
pub const CODE_RESTART_REQUIRED: u16 = 515;

/// What kind of disconnect this was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// No code, or a code we don't recognize.
    Unknown,
    /// Session invalidated remotely or local data rejected.
    SessionRejected,
    /// Transport closed, lost, or timed out.
    Transient,
    /// The protocol wants a fresh socket.
    RestartRequired,
}

impl DisconnectClass {
    pub fn of(status_code: Option<u16>) -> Self {
        match status_code {
            Some(CODE_LOGGED_OUT | CODE_BAD_SESSION) => Self::SessionRejected,
            Some(CODE_CONNECTION_LOST | CODE_CONNECTION_CLOSED) => Self::Transient,
            Some(CODE_RESTART_REQUIRED) => Self::RestartRequired,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DisconnectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::SessionRejected => "session rejected",
            Self::Transient => "transient",
            Self::RestartRequired => "restart required",
        };
        f.write_str(name)
    }
}

/// What kind of failure happened while setting up a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupFailureClass {
    /// Stored data failed to decode or decrypt.
    Integrity,
    Other,
}

impl StartupFailureClass {
    const INTEGRITY_MARKERS: [&'static str; 5] =
        ["decrypt", "decode", "invalid", "corrupt", "malformed"];

    /// Integrity if the message mentions one of the marker words
    /// (case-insensitive).
    pub fn of(message: &str) -> Self {
        let lower = message.to_lowercase();
        if Self::INTEGRITY_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Integrity
        } else {
            Self::Other
        }
    }
}

/// Reconnect timings and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Backoff step: the delay after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
    /// Backoff ceiling (before jitter).
    pub max_delay: Duration,
    /// Uniform random `0..=jitter` added to every backoff delay.
    pub jitter: Duration,
    /// Retries allowed for [`DisconnectClass::SessionRejected`].
    pub rejected_limit: u32,
    /// Retries allowed for [`StartupFailureClass::Integrity`].
    pub integrity_limit: u32,
    /// Delay before reconnecting after [`DisconnectClass::RestartRequired`].
    pub restart_delay: Duration,
    /// Delay before reconnecting after an explicit reset.
    pub reset_restart_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1_000),
            rejected_limit: 5,
            integrity_limit: 10,
            restart_delay: Duration::from_millis(1_000),
            reset_restart_delay: Duration::from_millis(3_000),
        }
    }
}

impl ReconnectPolicy {
    /// Fix values that would make the schedule nonsensical.
    ///
    /// - `max_delay` is raised to `base_delay` if smaller.
    pub fn validated(mut self) -> Self {
        if self.max_delay < self.base_delay {
            warn!(
                base_ms = self.base_delay.as_millis() as u64,
                max_ms = self.max_delay.as_millis() as u64,
                "max_delay below base_delay, raising"
            );
            self.max_delay = self.base_delay;
        }
        self
    }

    /// The shared backoff schedule: `min(max_delay, base_delay * n) + jitter`.
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy::linear(self.base_delay, Some(self.max_delay)).with_jitter(self.jitter)
    }
}
