//! Process configuration from flags and environment variables.
//!
//! Every field can be set either way; environment variables are read
//! after an optional `.env` file has been loaded.

use std::time::Duration;

use clap::Parser;
use linkrelay_delivery::{QueueConfig, WebhookConfig};
use linkrelay_session::PresenceConfig;
use linkrelay_store::PostgrestConfig;

use crate::RelayError;

/// linkrelay: keeps one messaging session alive and relays its traffic.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "linkrelay")]
pub struct RelayConfig {
    /// Base URL of the REST key-value service
    #[arg(long, env = "STORE_URL")]
    pub store_url: Option<String>,

    /// API key for the key-value service (required with STORE_URL)
    #[arg(long, env = "STORE_KEY", hide_env_values = true)]
    pub store_key: Option<String>,

    /// Session id under which credentials are stored
    #[arg(long, env = "SESSION_ID", default_value = "main")]
    pub session_id: String,

    /// Relation holding credential blobs
    #[arg(long, env = "AUTH_TABLE", default_value = "auth_data")]
    pub auth_table: String,

    /// Relation receiving message records
    #[arg(long, env = "MESSAGES_TABLE", default_value = "messages")]
    pub messages_table: String,

    /// Relation receiving connection lifecycle rows
    #[arg(long, env = "CONNECTION_LOG_TABLE", default_value = "connection_logs")]
    pub connection_log_table: String,

    /// Webhook endpoints, comma separated
    #[arg(long, env = "WEBHOOK_URLS", value_delimiter = ',')]
    pub webhook_urls: Vec<String>,

    /// Per-request webhook timeout in milliseconds
    #[arg(long, env = "WEBHOOK_TIMEOUT_MS", default_value = "30000")]
    pub webhook_timeout_ms: u64,

    /// Interval between presence announcements in milliseconds
    #[arg(long, env = "PRESENCE_INTERVAL_MS", default_value = "30000")]
    pub presence_interval_ms: u64,

    /// Minimum gap between outbound sends in milliseconds
    #[arg(long, env = "QUEUE_PACING_MS", default_value = "500")]
    pub queue_pacing_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl RelayConfig {
    /// Loads `.env` if present, then parses flags and environment.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::parse()
    }

    /// Checks combinations clap can't express.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.store_url.is_some() && self.store_key.as_deref().is_none_or(str::is_empty) {
            return Err(RelayError::Config("STORE_KEY is required with STORE_URL".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(RelayError::Config("SESSION_ID must not be empty".into()));
        }
        if let Some(bad) = self
            .webhook_urls()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(RelayError::Config(format!("webhook url is not http(s): {bad}")));
        }
        Ok(())
    }

    /// Configured webhook endpoints with blanks removed.
    pub fn webhook_urls(&self) -> impl Iterator<Item = &str> {
        self.webhook_urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
    }

    /// The key-value service settings, if a store is configured.
    pub fn postgrest(&self) -> Option<PostgrestConfig> {
        let url = self.store_url.as_ref()?;
        let key = self.store_key.as_ref()?;
        let mut config = PostgrestConfig::new(url.clone(), key.clone());
        config.table = self.auth_table.clone();
        Some(config)
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            timeout: Duration::from_millis(self.webhook_timeout_ms),
            ..WebhookConfig::default()
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            interval: Duration::from_millis(self.presence_interval_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            pacing: Duration::from_millis(self.queue_pacing_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RelayConfig {
        RelayConfig::try_parse_from(std::iter::once("linkrelay").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_match_production_constants() {
        let config = parse(&["--session-id", "main"]);

        assert_eq!(config.presence_config().interval, Duration::from_secs(30));
        assert_eq!(config.queue_config().pacing, Duration::from_millis(500));
        assert_eq!(config.webhook_config().timeout, Duration::from_secs(30));
        assert_eq!(config.webhook_config().max_attempts, 3);
    }

    #[test]
    fn test_webhook_urls_split_on_commas() {
        let config = parse(&["--webhook-urls", "https://a.example/hook, https://b.example/hook,"]);

        let urls: Vec<&str> = config.webhook_urls().collect();
        assert_eq!(urls, vec!["https://a.example/hook", "https://b.example/hook"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_store_url_without_key() {
        let mut config = parse(&[]);
        config.store_url = Some("https://db.example".into());
        config.store_key = None;

        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_webhook() {
        let config = parse(&["--webhook-urls", "ftp://nope"]);
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_postgrest_uses_auth_table() {
        let mut config = parse(&["--auth-table", "creds"]);
        config.store_url = Some("https://db.example".into());
        config.store_key = Some("key".into());

        let pg = config.postgrest().unwrap();
        assert_eq!(pg.table, "creds");
        assert_eq!(pg.base_url, "https://db.example");
    }
}
