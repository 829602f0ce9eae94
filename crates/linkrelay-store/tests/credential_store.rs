//! Integration tests for the credential write/read protocol.
//!
//! All tests run against `MemoryKvStore` with paused time so retry delays
//! are exact and instant.

use std::sync::Arc;
use std::time::Duration;

use linkrelay_protocol::buffer_value;
use linkrelay_store::{
    AuthRow, CredentialStore, KvStore, MemoryKvStore, ReadOutcome, StoreError, backup_name,
    file_name,
};
use serde_json::{Value, json};
use tokio::time::Instant;

// =========================================================================
// Helpers
// =========================================================================

const SESSION: &str = "session-a";

fn store() -> (MemoryKvStore, CredentialStore<MemoryKvStore>) {
    let kv = MemoryKvStore::new();
    let store = CredentialStore::new(Arc::new(kv.clone()), SESSION);
    (kv, store)
}

/// Pauses after every delete so other operations can interleave.
#[derive(Clone)]
struct SlowDeletes {
    inner: MemoryKvStore,
    pause: Duration,
}

impl KvStore for SlowDeletes {
    async fn get(&self, session_id: &str, file_name: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(session_id, file_name).await
    }

    async fn upsert(&self, row: AuthRow) -> Result<(), StoreError> {
        self.inner.upsert(row).await
    }

    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), StoreError> {
        self.inner.delete(session_id, file_name).await?;
        tokio::time::sleep(self.pause).await;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.delete_session(session_id).await
    }
}

fn blob(n: u8) -> Value {
    json!({ "registrationId": n, "noiseKey": { "public": buffer_value(&[n, n, n]) } })
}

// =========================================================================
// Write
// =========================================================================

#[tokio::test]
async fn test_write_then_read_returns_same_value() {
    let (_, store) = store();

    store.write("creds.json", &blob(1)).await.unwrap();

    assert_eq!(store.read("creds.json").await.unwrap(), ReadOutcome::Found(blob(1)));
}

#[tokio::test]
async fn test_write_copies_previous_primary_to_backup() {
    let (kv, store) = store();

    store.write("creds.json", &blob(1)).await.unwrap();
    let first = kv.raw(SESSION, "creds_json").unwrap();
    store.write("creds.json", &blob(2)).await.unwrap();

    assert_eq!(kv.raw(SESSION, "creds_json.backup"), Some(first));
}

#[tokio::test]
async fn test_write_first_time_creates_no_backup() {
    let (kv, store) = store();

    store.write("creds.json", &blob(1)).await.unwrap();

    assert_eq!(kv.raw(SESSION, "creds_json.backup"), None);
    assert_eq!(kv.upsert_count("creds_json"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_rejects_scalar_without_touching_store() {
    let (kv, store) = store();

    let err = store.write("creds.json", &json!("text")).await.unwrap_err();

    assert!(matches!(err, StoreError::WriteFailed { attempts: 3, .. }));
    assert!(kv.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_rejects_empty_object() {
    let (kv, store) = store();

    assert!(store.write("creds.json", &json!({})).await.is_err());
    assert!(kv.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_retries_with_linear_delay_then_succeeds() {
    let (kv, store) = store();
    kv.fail_next_upserts(2);
    let start = Instant::now();

    store.write("creds.json", &blob(1)).await.unwrap();

    // 1s after attempt 1, 2s after attempt 2.
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(store.read("creds.json").await.unwrap(), ReadOutcome::Found(blob(1)));
}

#[tokio::test(start_paused = true)]
async fn test_write_gives_up_after_three_attempts() {
    let (kv, store) = store();
    kv.fail_next_upserts(3);

    let err = store.write("creds.json", &blob(1)).await.unwrap_err();

    match err {
        StoreError::WriteFailed { key, attempts, source } => {
            assert_eq!(key, "creds.json");
            assert_eq!(attempts, 3);
            assert!(matches!(*source, StoreError::Backend { status: 503, .. }));
        }
        other => panic!("expected WriteFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_write_over_corrupt_primary_keeps_good_backup() {
    let (kv, store) = store();
    store.write("creds.json", &blob(1)).await.unwrap();
    store.write("creds.json", &blob(2)).await.unwrap();
    let good_backup = kv.raw(SESSION, "creds_json.backup");
    kv.put_raw(SESSION, "creds_json", "{not json");

    store.write("creds.json", &blob(3)).await.unwrap();

    assert_eq!(kv.raw(SESSION, "creds_json.backup"), good_backup);
}

#[tokio::test]
async fn test_concurrent_writes_to_same_key_all_land() {
    let (kv, store) = store();

    let writes = (1..=5).map(|n| {
        let store = store.clone();
        tokio::spawn(async move { store.write("creds.json", &blob(n)).await })
    });
    for handle in writes.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(kv.upsert_count("creds_json"), 5);
    // Each write after the first backed up a complete, valid primary.
    let backup = kv.raw(SESSION, "creds_json.backup").unwrap();
    assert!(serde_json::from_str::<Value>(&backup).is_ok());
}

// =========================================================================
// Read
// =========================================================================

#[tokio::test]
async fn test_read_missing_key_is_missing() {
    let (_, store) = store();
    assert_eq!(store.read("nope.json").await.unwrap(), ReadOutcome::Missing);
}

#[tokio::test]
async fn test_read_corrupt_primary_restores_from_backup() {
    let (kv, store) = store();
    store.write("creds.json", &blob(1)).await.unwrap();
    store.write("creds.json", &blob(2)).await.unwrap();
    kv.put_raw(SESSION, "creds_json", "\u{0}\u{0}garbage");

    let first = store.read("creds.json").await.unwrap();
    let second = store.read("creds.json").await.unwrap();

    assert_eq!(first, ReadOutcome::Restored(blob(1)));
    assert_eq!(second, ReadOutcome::Found(blob(1)));
}

#[tokio::test]
async fn test_read_missing_primary_restores_from_backup() {
    let (kv, store) = store();
    kv.put_raw(SESSION, &backup_name(&file_name("pre-key-1.json")), r#"{"k":1}"#);

    let outcome = store.read("pre-key-1.json").await.unwrap();

    assert_eq!(outcome, ReadOutcome::Restored(json!({ "k": 1 })));
    assert_eq!(kv.raw(SESSION, "pre-key-1_json").as_deref(), Some(r#"{"k":1}"#));
}

#[tokio::test]
async fn test_read_unrevivable_primary_without_backup_is_salvaged() {
    let (kv, store) = store();
    let raw = r#"{"key":{"type":"Buffer","data":"%%not-base64%%"}}"#;
    kv.put_raw(SESSION, "creds_json", raw);

    let outcome = store.read("creds.json").await.unwrap();

    assert_eq!(
        outcome,
        ReadOutcome::Salvaged(json!({ "key": { "type": "Buffer", "data": "%%not-base64%%" } }))
    );
}

#[tokio::test]
async fn test_read_garbage_everywhere_is_unrecoverable() {
    let (kv, store) = store();
    kv.put_raw(SESSION, "creds_json", "garbage");
    kv.put_raw(SESSION, "creds_json.backup", "also garbage");

    assert_eq!(store.read("creds.json").await.unwrap(), ReadOutcome::Unrecoverable);
}

#[tokio::test]
async fn test_read_backend_failure_is_an_error() {
    let (kv, store) = store();
    kv.fail_next_gets(1);

    assert!(matches!(
        store.read("creds.json").await,
        Err(StoreError::Backend { status: 503, .. })
    ));
}

// =========================================================================
// Remove / clear
// =========================================================================

#[tokio::test]
async fn test_remove_deletes_primary_and_backup() {
    let (_, store) = store();
    store.write("pre-key-1.json", &blob(1)).await.unwrap();
    store.write("pre-key-1.json", &blob(2)).await.unwrap();

    store.remove("pre-key-1.json").await.unwrap();

    assert_eq!(store.read("pre-key-1.json").await.unwrap(), ReadOutcome::Missing);
}

#[tokio::test(start_paused = true)]
async fn test_read_during_remove_does_not_resurrect_key() {
    let kv = MemoryKvStore::new();
    let store = CredentialStore::new(
        Arc::new(SlowDeletes {
            inner: kv.clone(),
            pause: Duration::from_millis(50),
        }),
        SESSION,
    );
    store.write("pre-key-1.json", &blob(1)).await.unwrap();
    store.write("pre-key-1.json", &blob(2)).await.unwrap();

    let (removed, during) = tokio::join!(store.remove("pre-key-1.json"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.read("pre-key-1.json").await
    });
    removed.unwrap();

    assert_ne!(during.unwrap(), ReadOutcome::Restored(blob(1)));
    assert_eq!(store.read("pre-key-1.json").await.unwrap(), ReadOutcome::Missing);
    assert_eq!(kv.raw(SESSION, "pre-key-1_json"), None);
    assert_eq!(kv.raw(SESSION, "pre-key-1_json.backup"), None);
}

#[tokio::test(start_paused = true)]
async fn test_recovering_read_waits_for_remove_and_sees_nothing() {
    let kv = MemoryKvStore::new();
    let store = CredentialStore::new(
        Arc::new(SlowDeletes {
            inner: kv.clone(),
            pause: Duration::from_millis(50),
        }),
        SESSION,
    );
    store.write("pre-key-1.json", &blob(1)).await.unwrap();
    store.write("pre-key-1.json", &blob(2)).await.unwrap();
    kv.put_raw(SESSION, "pre-key-1_json", "{not json");

    let (removed, during) = tokio::join!(store.remove("pre-key-1.json"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.read("pre-key-1.json").await
    });
    removed.unwrap();

    assert_eq!(during.unwrap(), ReadOutcome::Missing);
    assert_eq!(kv.raw(SESSION, "pre-key-1_json"), None);
}

#[tokio::test]
async fn test_clear_session_leaves_other_sessions() {
    let (kv, store) = store();
    let other = CredentialStore::new(Arc::new(kv.clone()), "session-b");
    store.write("creds.json", &blob(1)).await.unwrap();
    other.write("creds.json", &blob(2)).await.unwrap();

    store.clear_session().await.unwrap();

    assert_eq!(store.read("creds.json").await.unwrap(), ReadOutcome::Missing);
    assert_eq!(other.read("creds.json").await.unwrap(), ReadOutcome::Found(blob(2)));
}
