//! Durable read/write of credential blobs with backup and recovery.
//!
//! # Write protocol
//!
//! Each attempt runs these steps in order; any failure fails the attempt:
//!
//! 1. the value must be a JSON object or array,
//! 2. encoding must produce a non-empty payload,
//! 3. the encoded text must decode and re-encode to itself,
//! 4. the current primary (if it decodes) is copied to the backup slot,
//! 5. the new payload is upserted into the primary slot,
//! 6. the primary is read back and must decode.
//!
//! Failed attempts are retried with a linear delay. Partial writes are not
//! rolled back.
//!
//! # Read protocol
//!
//! ```text
//! primary ok ───────────────────────────────────────────→ Found
//! primary missing/corrupt → backup ok → restore primary → Restored
//!                         → backup missing/corrupt → structural parse → Salvaged
//!                                                   → nothing usable   → Missing / Unrecoverable
//! ```

use std::sync::Arc;
use std::time::Duration;

use linkrelay_protocol::{BufferJsonCodec, Codec};
use linkrelay_retry::{RetryPolicy, retry};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{AuthRow, KvStore, StoreError, WriteSerializer};

const BACKUP_SUFFIX: &str = ".backup";

/// Maps a logical key to its flat `file_name` token.
///
/// `/` → `__`, `:` → `-`, `.` → `_`.
pub fn file_name(key: &str) -> String {
    key.replace('/', "__").replace(':', "-").replace('.', "_")
}

/// The backup slot for a `file_name`.
pub fn backup_name(file_name: &str) -> String {
    format!("{file_name}{BACKUP_SUFFIX}")
}

/// Retry and batching settings for credential writes.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `n * retry_step`.
    pub retry_step: Duration,
    /// Concurrent key writes per batch.
    pub key_batch_size: usize,
    /// Pause between key batches.
    pub key_batch_pause: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_step: Duration::from_secs(1),
            key_batch_size: 5,
            key_batch_pause: Duration::from_millis(100),
        }
    }
}

impl WriteConfig {
    /// Fixes values that would stall or skip work.
    pub fn validated(mut self) -> Self {
        if self.key_batch_size == 0 {
            warn!("key_batch_size of 0 raised to 1");
            self.key_batch_size = 1;
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.retry_step, None)
            .with_max_attempts(self.max_attempts)
            .validated()
    }
}

/// What a read found.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Primary decoded cleanly.
    Found(Value),
    /// No primary and no backup.
    Missing,
    /// Primary was missing or corrupt; the backup was valid and has been
    /// copied back over the primary.
    Restored(Value),
    /// Nothing decoded fully; this is a structural parse without value
    /// revival.
    Salvaged(Value),
    /// Data existed but nothing could be parsed.
    Unrecoverable,
}

impl ReadOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Found(v) | Self::Restored(v) | Self::Salvaged(v) => Some(v),
            Self::Missing | Self::Unrecoverable => None,
        }
    }

    /// `true` when the value came from somewhere other than a clean primary.
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Restored(_) | Self::Salvaged(_))
    }
}

/// Credential blobs for one session, stored through a [`KvStore`].
///
/// Cheap to clone; clones share the backend and the write locks.
pub struct CredentialStore<S> {
    kv: Arc<S>,
    codec: Arc<dyn Codec>,
    session_id: String,
    serializer: WriteSerializer,
    config: WriteConfig,
}

impl<S> Clone for CredentialStore<S> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            codec: Arc::clone(&self.codec),
            session_id: self.session_id.clone(),
            serializer: self.serializer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: KvStore> CredentialStore<S> {
    pub fn new(kv: Arc<S>, session_id: impl Into<String>) -> Self {
        Self {
            kv,
            codec: Arc::new(BufferJsonCodec),
            session_id: session_id.into(),
            serializer: WriteSerializer::new(),
            config: WriteConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WriteConfig) -> Self {
        self.config = config.validated();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.kv
    }

    /// Durably writes `value` under `key`.
    ///
    /// Writes to the same key never interleave. Returns
    /// [`StoreError::WriteFailed`] once every attempt has failed.
    pub async fn write(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let file = file_name(key);
        let lock_key = format!("{}:{}", self.session_id, file);
        let policy = self.config.retry_policy();

        let result = self
            .serializer
            .with_key_lock(&lock_key, || {
                retry("credential.write", &policy, |_| self.write_once(&file, value))
            })
            .await;

        match result {
            Ok(()) => {
                if key == crate::CREDS_KEY {
                    info!(session = %self.session_id, "credentials saved");
                } else {
                    debug!(key, "credential blob saved");
                }
                Ok(())
            }
            Err(e) => {
                let attempts = e.attempts();
                error!(key, attempts, "credential write failed");
                Err(StoreError::WriteFailed {
                    key: key.to_string(),
                    attempts,
                    source: Box::new(e.into_last()),
                })
            }
        }
    }

    async fn write_once(&self, file: &str, value: &Value) -> Result<(), StoreError> {
        if !(value.is_object() || value.is_array()) {
            return Err(StoreError::InvalidBlob("expected an object or array".into()));
        }

        let encoded = self.codec.encode(value)?;
        if encoded.is_empty() || encoded == "null" || encoded == "{}" {
            return Err(StoreError::InvalidBlob("serialization produced an empty payload".into()));
        }

        let decoded = self.codec.decode(&encoded)?;
        if self.codec.encode(&decoded)? != encoded {
            return Err(StoreError::InvalidBlob("round trip changed the payload".into()));
        }

        if let Some(existing) = self.kv.get(&self.session_id, file).await? {
            if self.codec.decode(&existing).is_ok() {
                self.kv
                    .upsert(AuthRow::new(&self.session_id, &backup_name(file), existing))
                    .await?;
            } else {
                warn!(file, "current primary is corrupt, keeping previous backup");
            }
        }

        self.kv
            .upsert(AuthRow::new(&self.session_id, file, encoded))
            .await?;

        let stored = self
            .kv
            .get(&self.session_id, file)
            .await?
            .ok_or_else(|| StoreError::Verification("data not found".into()))?;
        self.codec
            .decode(&stored)
            .map_err(|e| StoreError::Verification(format!("data corrupted: {e}")))?;
        Ok(())
    }

    /// Reads `key`, falling back to the backup and repairing the primary
    /// when needed.
    ///
    /// A clean primary is returned without locking. Recovery runs under the
    /// key's write lock and re-reads both slots, so it never races a
    /// concurrent `write` or `remove` on the same key.
    ///
    /// Only backend failures are errors; corruption is reported through
    /// [`ReadOutcome`].
    pub async fn read(&self, key: &str) -> Result<ReadOutcome, StoreError> {
        let file = file_name(key);

        if let Some(raw) = self.kv.get(&self.session_id, &file).await? {
            if let Ok(value) = self.codec.decode(&raw) {
                return Ok(ReadOutcome::Found(value));
            }
        }

        let lock_key = format!("{}:{}", self.session_id, file);
        let _guard = self.serializer.lock(&lock_key).await;
        self.recover(key, &file).await
    }

    /// The slow path of [`read`](Self::read). Caller holds the key lock.
    async fn recover(&self, key: &str, file: &str) -> Result<ReadOutcome, StoreError> {
        let primary = self.kv.get(&self.session_id, file).await?;
        match &primary {
            Some(raw) => match self.codec.decode(raw) {
                Ok(value) => return Ok(ReadOutcome::Found(value)),
                Err(e) => warn!(key, error = %e, "corrupt primary, trying backup"),
            },
            None => debug!(key, "primary not found, checking backup"),
        }

        let backup = self.kv.get(&self.session_id, &backup_name(file)).await?;
        if let Some(raw) = &backup {
            match self.codec.decode(raw) {
                Ok(value) => {
                    let restore = AuthRow::new(&self.session_id, file, raw.clone());
                    match self.kv.upsert(restore).await {
                        Ok(()) => warn!(key, "primary restored from backup"),
                        Err(e) => warn!(key, error = %e, "backup is valid but restoring primary failed"),
                    }
                    return Ok(ReadOutcome::Restored(value));
                }
                Err(e) => warn!(key, error = %e, "backup also corrupt"),
            }
        }

        let Some(raw) = primary.as_deref().or(backup.as_deref()) else {
            debug!(key, "not found");
            return Ok(ReadOutcome::Missing);
        };

        warn!(key, "attempting salvage");
        match self.codec.decode_structural(raw) {
            Ok(value) => {
                warn!(key, "salvaged without value revival");
                Ok(ReadOutcome::Salvaged(value))
            }
            Err(e) => {
                error!(key, error = %e, "unrecoverable");
                Ok(ReadOutcome::Unrecoverable)
            }
        }
    }

    /// Deletes `key` and its backup so the backup can't resurrect it.
    ///
    /// The backup goes first: a lock-free read between the two deletes
    /// still sees the primary and never falls back to the backup.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let file = file_name(key);
        let lock_key = format!("{}:{}", self.session_id, file);
        let _guard = self.serializer.lock(&lock_key).await;

        self.kv.delete(&self.session_id, &backup_name(&file)).await?;
        self.kv.delete(&self.session_id, &file).await?;
        debug!(key, "credential blob removed");
        Ok(())
    }

    /// Deletes every row for this session.
    pub async fn clear_session(&self) -> Result<(), StoreError> {
        self.kv.delete_session(&self.session_id).await?;
        warn!(session = %self.session_id, "all stored credentials deleted");
        Ok(())
    }
}
