//! Where message records and connection log rows are written.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use linkrelay_protocol::{ConnectionLogEntry, MessageRecord};
use linkrelay_session::ConnectionLog;
use linkrelay_store::{PostgrestStore, StoreError};

/// Append-only destination for [`MessageRecord`]s.
pub trait MessageSink: Send + Sync + 'static {
    fn save(&self, record: &MessageRecord) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Keeps records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageSink {
    records: Arc<Mutex<Vec<MessageRecord>>>,
}

impl MemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MessageRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl MessageSink for MemoryMessageSink {
    async fn save(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.lock().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PostgREST
// ---------------------------------------------------------------------------

/// Inserts rows into a relation of the REST key-value service.
///
/// One type serves both the message relation and the connection log; each
/// instance is bound to a single table.
#[derive(Clone)]
pub struct PostgrestRows {
    store: PostgrestStore,
    table: String,
}

impl PostgrestRows {
    pub fn new(store: PostgrestStore, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl MessageSink for PostgrestRows {
    async fn save(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.store.insert(&self.table, record).await
    }
}

impl ConnectionLog for PostgrestRows {
    async fn record(&self, entry: ConnectionLogEntry) -> Result<(), StoreError> {
        self.store.insert(&self.table, &entry).await
    }
}
