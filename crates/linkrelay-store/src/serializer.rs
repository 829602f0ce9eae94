//! Per-key mutual exclusion for credential writes.
//!
//! The backing store has no native locking, and the credential write
//! protocol is several round-trips long (read primary, copy to backup,
//! write, verify). Two interleaved writes to the same key could leave the
//! backup holding something that was never the previous primary.
//!
//! [`WriteSerializer`] hands out one async mutex per key. Callers for the
//! same key queue on it; callers for different keys never touch each
//! other's mutex. The lock is released when the [`KeyGuard`] drops, so it
//! is released on every exit path including errors and panics.
//!
//! ```text
//! locks: { "s1:creds_json" → Arc<Mutex<()>> }
//!            ▲        ▲
//!   guard (holder)   waiter (clone of the Arc, parked in lock_owned)
//! ```
//!
//! Entries are removed when the last guard drops and nobody else holds the
//! `Arc`, so the map only ever contains keys that are in use. A waiter
//! cancelled before it acquires the lock does the same cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Hands out per-key async locks. Clones share the same lock table.
#[derive(Clone, Default)]
pub struct WriteSerializer {
    locks: Arc<Mutex<LockMap>>,
}

impl WriteSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.table();
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let pending = PendingLock {
            key: key.to_string(),
            owner: self.clone(),
            acquire: Some(Box::pin(mutex.lock_owned())),
        };
        let guard = pending.await;
        trace!(key, "key lock acquired");
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            owner: self.clone(),
        }
    }

    /// Runs `f` while holding the lock for `key`.
    pub async fn with_key_lock<T, F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    /// Number of keys currently locked or waited on.
    pub fn active_keys(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops the entry for `key` if the map holds the only reference.
    fn prune(&self, key: &str) {
        let mut map = self.table();
        if map.get(key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            map.remove(key);
        }
    }
}

type Acquire = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// A `lock_owned` in progress. If dropped before it resolves, it releases
/// its `Arc` and then prunes the entry.
struct PendingLock {
    key: String,
    owner: WriteSerializer,
    acquire: Option<Acquire>,
}

impl Future for PendingLock {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(acquire) = self.acquire.as_mut() else {
            return Poll::Pending;
        };
        let guard = ready!(acquire.as_mut().poll(cx));
        self.acquire = None;
        Poll::Ready(guard)
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if self.acquire.take().is_some() {
            self.owner.prune(&self.key);
            trace!(key = %self.key, "key lock wait cancelled");
        }
    }
}

/// Exclusive access to one key. Dropping it releases the lock.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    owner: WriteSerializer,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count below no longer includes us.
        drop(self.guard.take());
        self.owner.prune(&self.key);
        trace!(key = %self.key, "key lock released");
    }
}
