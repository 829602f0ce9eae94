//! Durable state for linkrelay.
//!
//! The session's credentials and protocol keys must survive restarts, and
//! the only persistence available is a remote key-value service with no
//! locking and no transactions. This crate layers safety on top of it:
//!
//! - [`KvStore`] — the raw row interface ([`MemoryKvStore`] for tests,
//!   [`PostgrestStore`] for the real service).
//! - [`WriteSerializer`] — one in-flight write per key.
//! - [`CredentialStore`] — validated writes with backup-before-overwrite
//!   and read-back verification; reads that self-heal from the backup.
//! - [`AuthState`] — loads, initializes, or repairs the credential set and
//!   serves the messaging client's key callbacks.
//!
//! # How it fits in the stack
//!
//! ```text
//! Session Layer (above)  ← loads creds at connect, saves rotations
//!     ↕
//! Store Layer (this crate)
//!     ↕
//! KvStore backend  ← auth_data(session_id, file_name, file_data, updated_at)
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod credentials;
mod error;
mod kv;
mod postgrest;
mod serializer;

pub use auth::{AuthKeys, AuthLoad, AuthState, CREDS_KEY, REQUIRED_CRED_FIELDS};
pub use credentials::{CredentialStore, ReadOutcome, WriteConfig, backup_name, file_name};
pub use error::StoreError;
pub use kv::{AuthRow, KvStore, MemoryKvStore};
pub use postgrest::{PostgrestConfig, PostgrestStore};
pub use serializer::{KeyGuard, WriteSerializer};
