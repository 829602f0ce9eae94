//! The key-value seam under the credential store.
//!
//! One relation, `auth_data(session_id, file_name, file_data, updated_at)`,
//! unique on `(session_id, file_name)`. The store has no locking and no
//! transactions; everything above this trait has to cope with that.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// One row of `auth_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRow {
    pub session_id: String,
    pub file_name: String,
    pub file_data: String,
    pub updated_at: DateTime<Utc>,
}

impl AuthRow {
    pub fn new(session_id: &str, file_name: &str, file_data: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
            file_data: file_data.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Remote key-value persistence for credential blobs.
pub trait KvStore: Send + Sync + 'static {
    /// Returns the stored text, or `None` if there is no row.
    fn get(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Inserts or replaces the row keyed by `(session_id, file_name)`.
    fn upsert(&self, row: AuthRow) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes one row. Deleting a missing row is not an error.
    fn delete(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes every row for `session_id`.
    fn delete_session(&self, session_id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<(String, String), AuthRow>,
    upserts: HashMap<String, usize>,
    fail_upserts: usize,
    fail_gets: usize,
}

/// [`KvStore`] backed by a `HashMap`, with fault injection for tests.
///
/// Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` upserts fail with a 503.
    pub fn fail_next_upserts(&self, n: usize) {
        self.lock().fail_upserts = n;
    }

    /// Makes the next `n` gets fail with a 503.
    pub fn fail_next_gets(&self, n: usize) {
        self.lock().fail_gets = n;
    }

    /// Writes raw text, bypassing every check. Used to plant corruption.
    pub fn put_raw(&self, session_id: &str, file_name: &str, file_data: &str) {
        let row = AuthRow::new(session_id, file_name, file_data);
        self.lock()
            .rows
            .insert((session_id.to_string(), file_name.to_string()), row);
    }

    pub fn raw(&self, session_id: &str, file_name: &str) -> Option<String> {
        self.lock()
            .rows
            .get(&(session_id.to_string(), file_name.to_string()))
            .map(|r| r.file_data.clone())
    }

    /// Successful upserts of `file_name`, across all sessions.
    pub fn upsert_count(&self, file_name: &str) -> usize {
        self.lock().upserts.get(file_name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn injected() -> StoreError {
    StoreError::Backend {
        status: 503,
        message: "injected failure".into(),
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, session_id: &str, file_name: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        if inner.fail_gets > 0 {
            inner.fail_gets -= 1;
            return Err(injected());
        }
        Ok(inner
            .rows
            .get(&(session_id.to_string(), file_name.to_string()))
            .map(|r| r.file_data.clone()))
    }

    async fn upsert(&self, row: AuthRow) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_upserts > 0 {
            inner.fail_upserts -= 1;
            return Err(injected());
        }
        *inner.upserts.entry(row.file_name.clone()).or_default() += 1;
        inner
            .rows
            .insert((row.session_id.clone(), row.file_name.clone()), row);
        Ok(())
    }

    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), StoreError> {
        self.lock()
            .rows
            .remove(&(session_id.to_string(), file_name.to_string()));
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.lock().rows.retain(|(sid, _), _| sid != session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_upsert_replaces_row() {
        let kv = MemoryKvStore::new();
        kv.upsert(AuthRow::new("s1", "a", "1")).await.unwrap();
        kv.upsert(AuthRow::new("s1", "a", "2")).await.unwrap();

        assert_eq!(kv.get("s1", "a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.upsert_count("a"), 2);
    }

    #[tokio::test]
    async fn test_memory_delete_session_keeps_other_sessions() {
        let kv = MemoryKvStore::new();
        kv.put_raw("s1", "a", "1");
        kv.put_raw("s1", "b", "1");
        kv.put_raw("s2", "a", "1");

        kv.delete_session("s1").await.unwrap();

        assert_eq!(kv.len(), 1);
        assert!(kv.raw("s2", "a").is_some());
    }

    #[tokio::test]
    async fn test_memory_injected_failures_are_consumed() {
        let kv = MemoryKvStore::new();
        kv.fail_next_upserts(1);

        assert!(kv.upsert(AuthRow::new("s", "a", "1")).await.is_err());
        assert!(kv.upsert(AuthRow::new("s", "a", "1")).await.is_ok());
    }
}
