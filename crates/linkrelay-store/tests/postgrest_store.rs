//! `PostgrestStore` against a wiremock server.

use linkrelay_store::{AuthRow, KvStore, PostgrestConfig, PostgrestStore, StoreError};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =========================================================================
// Helpers
// =========================================================================

const TABLE_PATH: &str = "/rest/v1/auth_data";

async fn setup() -> (MockServer, PostgrestStore) {
    let server = MockServer::start().await;
    let store = PostgrestStore::new(PostgrestConfig::new(server.uri(), "secret-key")).unwrap();
    (server, store)
}

// =========================================================================
// get
// =========================================================================

#[tokio::test]
async fn test_get_sends_filters_and_auth_headers() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .and(query_param("select", "file_data"))
        .and(query_param("session_id", "eq.s1"))
        .and(query_param("file_name", "eq.creds_json"))
        .and(header("apikey", "secret-key"))
        .and(header("authorization", "Bearer secret-key"))
        .and(header("accept", "application/vnd.pgrst.object+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "file_data": "{\"a\":1}" })))
        .expect(1)
        .mount(&server)
        .await;

    let data = store.get("s1", "creds_json").await.unwrap();

    assert_eq!(data.as_deref(), Some("{\"a\":1}"));
}

#[tokio::test]
async fn test_get_not_acceptable_means_no_row() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(406).set_body_json(json!({ "code": "PGRST116" })))
        .mount(&server)
        .await;

    assert_eq!(store.get("s1", "creds_json").await.unwrap(), None);
}

#[tokio::test]
async fn test_get_server_error_is_backend_error() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let err = store.get("s1", "creds_json").await.unwrap_err();

    assert!(matches!(err, StoreError::Backend { status: 503, message } if message == "down"));
}

// =========================================================================
// upsert / delete / insert
// =========================================================================

#[tokio::test]
async fn test_upsert_posts_row_with_merge_preference() {
    let (server, store) = setup().await;
    Mock::given(method("POST"))
        .and(path(TABLE_PATH))
        .and(query_param("on_conflict", "session_id,file_name"))
        .and(header("prefer", "resolution=merge-duplicates,return=minimal"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    store.upsert(AuthRow::new("s1", "creds_json", "{}")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body[0]["session_id"], "s1");
    assert_eq!(body[0]["file_name"], "creds_json");
    assert_eq!(body[0]["file_data"], "{}");
    assert!(body[0]["updated_at"].is_string());
}

#[tokio::test]
async fn test_delete_session_filters_by_session_only() {
    let (server, store) = setup().await;
    Mock::given(method("DELETE"))
        .and(path(TABLE_PATH))
        .and(query_param("session_id", "eq.s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    store.delete_session("s1").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].url.query().unwrap_or_default().contains("file_name"));
}

#[tokio::test]
async fn test_delete_single_row() {
    let (server, store) = setup().await;
    Mock::given(method("DELETE"))
        .and(path(TABLE_PATH))
        .and(query_param("file_name", "eq.pre-key-1_json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    store.delete("s1", "pre-key-1_json").await.unwrap();
}

#[tokio::test]
async fn test_insert_wraps_row_in_array() {
    let (server, store) = setup().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/connection_logs"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    store
        .insert("connection_logs", &json!({ "event_type": "connected" }))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, json!([{ "event_type": "connected" }]));
}

#[test]
fn test_new_rejects_unprintable_key() {
    let result = PostgrestStore::new(PostgrestConfig::new("http://localhost", "bad\nkey"));
    assert!(matches!(result, Err(StoreError::Config(_))));
}
