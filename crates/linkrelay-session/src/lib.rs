//! Connection supervision for linkrelay.
//!
//! One messaging session per process, kept alive across every kind of
//! disconnect the network throws at it:
//!
//! - [`DisconnectClass`] / [`StartupFailureClass`] — sort failures into
//!   retry rules.
//! - [`SessionMachine`] — the pure state machine: attempts, generations,
//!   and the FATAL terminal state.
//! - [`ConnectionSupervisor`] — the actor that runs the machine against a
//!   real [`Connector`](linkrelay_transport::Connector), with a single
//!   retry timer and generation-tagged attempts.
//! - [`PresenceKeeper`] — announces `available` while connected.
//!
//! # How it fits in the stack
//!
//! ```text
//! Relay (above)  ← sends through the active session, consumes InboundBatch
//!     ↕
//! Session Layer (this crate)
//!     ↕                      ↕
//! Transport (client)    Store (credentials, keys)
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! start() → CONNECTING ─┬─ pairing challenge → AWAITING_PAIRING ─┐
//!                       └─────────────── open ───────────────────┴→ CONNECTED
//!
//! close(401|500)  → backoff, FATAL after 5 retries
//! close(408|428)  → backoff, unlimited
//! close(515)      → reconnect after 1s, attempts reset
//! close(other)    → backoff, unlimited
//! reset()         → clear credentials, reconnect after 3s
//! ```

#![allow(async_fn_in_trait)]

mod error;
mod log;
mod machine;
mod policy;
mod presence;
mod supervisor;

pub use error::SessionError;
pub use log::{ConnectionLog, MemoryConnectionLog};
pub use machine::{ConnectionState, Effect, LifecycleEvent, MachineEvent, SessionMachine};
pub use policy::{
    CODE_BAD_SESSION, CODE_CONNECTION_CLOSED, CODE_CONNECTION_LOST, CODE_LOGGED_OUT,
    CODE_RESTART_REQUIRED, DisconnectClass, ReconnectPolicy, StartupFailureClass,
};
pub use presence::{PresenceConfig, PresenceKeeper};
pub use supervisor::{
    ActiveSession, ConnectionSupervisor, InboundBatch, PairingChallenge, SupervisorHandle,
    SupervisorStatus,
};
