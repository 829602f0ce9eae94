//! Identity and lifecycle types shared across the stack.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The messaging-network account a session is linked to.
///
/// A newtype over the raw id string (for example `"15551234567:3@s.net"`),
/// so an account id can't be confused with a chat id in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tags one session instance.
///
/// Every (re)connection attempt gets the next generation. Anything that
/// arrives tagged with an older generation came from a session that has
/// already been torn down and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// Returns the generation that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Connection log
// ---------------------------------------------------------------------------

/// One row of the append-only `connection_logs` relation.
///
/// `status_code` is `None` when the transport closed without reporting a
/// code at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub event_type: String,
    pub status_code: Option<u16>,
    pub reason: String,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionLogEntry {
    /// Event type for a successful connection.
    pub const CONNECTED: &'static str = "connected";
    /// Event type for a closed connection.
    pub const DISCONNECT: &'static str = "disconnect";

    /// A `connected` row, stamped now.
    pub fn connected() -> Self {
        Self {
            event_type: Self::CONNECTED.into(),
            status_code: Some(200),
            reason: "Success".into(),
            attempt_number: 0,
            timestamp: Utc::now(),
        }
    }

    /// A `disconnect` row, stamped now.
    pub fn disconnect(status_code: Option<u16>, reason: &str, attempt_number: u32) -> Self {
        Self {
            event_type: Self::DISCONNECT.into(),
            status_code,
            reason: reason.into(),
            attempt_number,
            timestamp: Utc::now(),
        }
    }
}
