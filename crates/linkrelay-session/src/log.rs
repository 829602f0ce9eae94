//! Where connection lifecycle rows go.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use linkrelay_protocol::ConnectionLogEntry;
use linkrelay_store::StoreError;

/// Append-only sink for [`ConnectionLogEntry`] rows.
///
/// Writes are best effort: the supervisor logs a failure and moves on.
pub trait ConnectionLog: Send + Sync + 'static {
    fn record(
        &self,
        entry: ConnectionLogEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Keeps rows in memory. Used by tests and by runs without a store.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionLog {
    entries: Arc<Mutex<Vec<ConnectionLogEntry>>>,
}

impl MemoryConnectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row recorded so far, oldest first.
    pub fn entries(&self) -> Vec<ConnectionLogEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ConnectionLogEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ConnectionLog for MemoryConnectionLog {
    async fn record(&self, entry: ConnectionLogEntry) -> Result<(), StoreError> {
        self.lock().push(entry);
        Ok(())
    }
}
