//! REST client for a PostgREST-style key-value service.
//!
//! Rows are addressed with `column=eq.value` filters; upserts use
//! `Prefer: resolution=merge-duplicates` with an explicit conflict target so
//! the `(session_id, file_name)` uniqueness drives the merge.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{AuthRow, KvStore, StoreError};

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Connection settings for [`PostgrestStore`].
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// Service root, e.g. `https://project.example.co`. `/rest/v1` is appended.
    pub base_url: String,
    /// Sent both as `apikey` and as a bearer token.
    pub api_key: String,
    /// Relation holding credential rows.
    pub table: String,
    pub timeout: Duration,
}

impl PostgrestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: "auth_data".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct FileData {
    file_data: Option<String>,
}

/// [`KvStore`] over HTTP. Also exposes a generic [`insert`](Self::insert)
/// used for append-only relations (message records, connection logs).
#[derive(Clone)]
pub struct PostgrestStore {
    config: PostgrestConfig,
    client: Client,
}

impl PostgrestStore {
    /// Builds the HTTP client with auth headers baked in.
    ///
    /// # Errors
    /// [`StoreError::Config`] if the key isn't a valid header value.
    pub fn new(config: PostgrestConfig) -> Result<Self, StoreError> {
        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(&config.api_key)
            .map_err(|e| StoreError::Config(format!("api key: {e}")))?;
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| StoreError::Config(format!("api key: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    /// Appends one row to `table`.
    pub async fn insert<T: Serialize + ?Sized>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(&[row])
            .send()
            .await?;
        check(response).await?;
        trace!(table, "row inserted");
        Ok(())
    }
}

/// Maps a non-success status to [`StoreError::Backend`].
async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Backend {
        status: status.as_u16(),
        message,
    })
}

impl KvStore for PostgrestStore {
    async fn get(&self, session_id: &str, file_name: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .client
            .get(self.table_url(&self.config.table))
            .header(header::ACCEPT, SINGLE_OBJECT)
            .query(&[
                ("select", "file_data".to_string()),
                ("session_id", format!("eq.{session_id}")),
                ("file_name", format!("eq.{file_name}")),
            ])
            .send()
            .await?;

        // Single-object requests answer 406 when zero rows match.
        if response.status() == StatusCode::NOT_ACCEPTABLE {
            debug!(file_name, "no row");
            return Ok(None);
        }

        let row: FileData = check(response).await?.json().await?;
        Ok(row.file_data)
    }

    async fn upsert(&self, row: AuthRow) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url(&self.config.table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", "session_id,file_name")])
            .json(&[&row])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.table_url(&self.config.table))
            .query(&[
                ("session_id", format!("eq.{session_id}")),
                ("file_name", format!("eq.{file_name}")),
            ])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.table_url(&self.config.table))
            .query(&[("session_id", format!("eq.{session_id}"))])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
