//! Credential bootstrap, repair, and the client's key callbacks.
//!
//! The messaging client needs two things from us at connect time: the
//! credential set (`creds.json`) and a [`KeyStore`] for its protocol keys
//! (`{category}-{id}.json`). Both live in the same [`CredentialStore`].

use std::collections::HashMap;

use futures_util::future::join_all;
use linkrelay_transport::{KeyStore, KeyWrite, TransportError};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{CredentialStore, KvStore, StoreError};

/// Logical key of the credential set.
pub const CREDS_KEY: &str = "creds.json";

/// Sub-fields that must be present for credentials to be usable.
pub const REQUIRED_CRED_FIELDS: [&str; 3] = ["noiseKey", "signedIdentityKey", "signedPreKey"];

/// Filled alongside the required fields during repair.
const REPAIR_EXTRA_FIELD: &str = "advSecretKey";

/// How [`AuthState::load_or_init`] obtained the credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthLoad {
    /// Stored credentials were complete.
    Loaded,
    /// Nothing usable was stored; a fresh set was generated and persisted.
    Initialized,
    /// Stored credentials were incomplete; these fields were filled from
    /// fresh material and written back.
    Repaired { filled: Vec<String> },
}

/// Credential access for one session.
pub struct AuthState<S> {
    store: CredentialStore<S>,
}

impl<S> Clone for AuthState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> AuthState<S> {
    pub fn new(store: CredentialStore<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore<S> {
        &self.store
    }

    /// Loads the credential set, creating or repairing it as needed.
    ///
    /// `fresh` is called at most once, only when new material is needed.
    ///
    /// # Errors
    /// Backend failures while reading are returned as-is. They are not
    /// treated as "no credentials", which would mint a new identity over
    /// a live one.
    pub async fn load_or_init<F>(&self, fresh: F) -> Result<(Value, AuthLoad), StoreError>
    where
        F: FnOnce() -> Value,
    {
        let outcome = self.store.read(CREDS_KEY).await?;
        let stored = outcome.into_value().filter(Value::is_object);

        let Some(mut creds) = stored else {
            warn!("no existing credentials, initializing new session");
            let creds = fresh();
            self.store.write(CREDS_KEY, &creds).await?;
            return Ok((creds, AuthLoad::Initialized));
        };

        let missing: Vec<&str> = REQUIRED_CRED_FIELDS
            .iter()
            .copied()
            .filter(|field| is_absent(&creds, field))
            .collect();

        if missing.is_empty() {
            let account = creds
                .pointer("/me/id")
                .and_then(Value::as_str)
                .unwrap_or("new");
            info!(account, "credentials loaded");
            return Ok((creds, AuthLoad::Loaded));
        }

        warn!(?missing, "incomplete credentials, repairing");
        let template = fresh();
        let mut filled = Vec::new();
        for field in missing.into_iter().chain([REPAIR_EXTRA_FIELD]) {
            if is_absent(&creds, field) {
                if let (Some(slot), Some(value)) = (creds.as_object_mut(), template.get(field)) {
                    slot.insert(field.to_string(), value.clone());
                    filled.push(field.to_string());
                }
            }
        }
        self.store.write(CREDS_KEY, &creds).await?;
        info!(?filled, "credentials repaired");
        Ok((creds, AuthLoad::Repaired { filled }))
    }

    /// Persists a rotated credential set.
    pub async fn save_credentials(&self, creds: &Value) -> Result<(), StoreError> {
        self.store.write(CREDS_KEY, creds).await
    }

    /// Deletes every stored blob for the session.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_session().await
    }

    /// The [`KeyStore`] handed to the messaging client.
    pub fn keys(&self) -> AuthKeys<S> {
        AuthKeys {
            store: self.store.clone(),
        }
    }
}

fn is_absent(creds: &Value, field: &str) -> bool {
    creds.get(field).is_none_or(Value::is_null)
}

fn key_name(category: &str, id: &str) -> String {
    format!("{category}-{id}.json")
}

/// Protocol-key callbacks backed by a [`CredentialStore`].
pub struct AuthKeys<S> {
    store: CredentialStore<S>,
}

impl<S> Clone for AuthKeys<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore> KeyStore for AuthKeys<S> {
    async fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Value>, TransportError> {
        let reads = ids.iter().map(|id| async move {
            let outcome = self.store.read(&key_name(category, id)).await;
            (id, outcome)
        });

        let mut found = HashMap::with_capacity(ids.len());
        for (id, outcome) in join_all(reads).await {
            let outcome = outcome.map_err(|e| TransportError::KeyStore(e.to_string()))?;
            if let Some(value) = outcome.into_value() {
                found.insert(id.clone(), value);
            }
        }
        Ok(found)
    }

    async fn set(&self, writes: Vec<KeyWrite>) -> Result<(), TransportError> {
        let config = self.store.config();
        let batches: Vec<&[KeyWrite]> = writes.chunks(config.key_batch_size.max(1)).collect();
        let total = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let ops = batch.iter().map(|write| async move {
                let key = key_name(&write.category, &write.id);
                let result = match &write.value {
                    Some(value) => self.store.write(&key, value).await,
                    None => self.store.remove(&key).await,
                };
                (key, result)
            });

            for (key, result) in join_all(ops).await {
                if let Err(e) = result {
                    error!(key, batch = index + 1, error = %e, "key write failed");
                }
            }

            if index + 1 < total {
                tokio::time::sleep(config.key_batch_pause).await;
            }
        }
        Ok(())
    }
}
