//! Webhook fan-out.
//!
//! Every payload goes to every configured endpoint. Endpoints are retried
//! independently on the shared schedule, so one dead endpoint never delays
//! or fails the others, and nothing is reported back to whoever produced
//! the message except a [`DispatchReport`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use linkrelay_protocol::WebhookPayload;
use linkrelay_retry::{RetryPolicy, retry_counted};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::WebhookError;

/// User agent sent with every webhook request.
pub const USER_AGENT: &str = concat!("linkrelay/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// WebhookConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Attempts per endpoint, including the first.
    pub max_attempts: u32,
    /// Wait after failed attempt `n` is `retry_delays[n - 1]`.
    pub retry_delays: Vec<Duration>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            timeout: Duration::from_secs(30),
        }
    }
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::schedule(self.retry_delays.clone())
            .with_max_attempts(self.max_attempts)
            .validated()
    }
}

// ---------------------------------------------------------------------------
// WebhookSender
// ---------------------------------------------------------------------------

/// Posts one payload to one endpoint, once.
pub trait WebhookSender: Send + Sync + 'static {
    fn post(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> impl Future<Output = Result<(), WebhookError>> + Send;
}

/// [`WebhookSender`] over HTTP: JSON body, fixed user agent, per-request
/// timeout. Any non-2xx status is a failure.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl WebhookSender for HttpWebhookSender {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WebhookError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch results
// ---------------------------------------------------------------------------

/// How one endpoint fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOutcome {
    pub url: String,
    pub attempts: u32,
    pub delivered: bool,
    /// The final error when `delivered` is false.
    pub last_error: Option<String>,
}

/// Per-endpoint outcomes, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<EndpointOutcome>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(|o| o.delivered)
    }

    pub fn outcome(&self, url: &str) -> Option<&EndpointOutcome> {
        self.outcomes.iter().find(|o| o.url == url)
    }
}

// ---------------------------------------------------------------------------
// WebhookDispatcher
// ---------------------------------------------------------------------------

/// Fans payloads out to the configured endpoints.
pub struct WebhookDispatcher<W> {
    endpoints: Arc<Vec<String>>,
    sender: Arc<W>,
    policy: RetryPolicy,
}

impl<W> Clone for WebhookDispatcher<W> {
    fn clone(&self) -> Self {
        Self {
            endpoints: Arc::clone(&self.endpoints),
            sender: Arc::clone(&self.sender),
            policy: self.policy.clone(),
        }
    }
}

impl<W: WebhookSender> WebhookDispatcher<W> {
    pub fn new(endpoints: Vec<String>, sender: Arc<W>, config: &WebhookConfig) -> Self {
        if endpoints.is_empty() {
            warn!("no webhook endpoints configured, payloads will not be forwarded");
        }
        Self {
            endpoints: Arc::new(endpoints),
            sender,
            policy: config.retry_policy(),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Delivers `payload` to every endpoint, each with its own retries.
    pub async fn dispatch(&self, payload: &WebhookPayload) -> DispatchReport {
        if self.endpoints.is_empty() {
            debug!(message_id = %payload.message_id, "no webhook endpoints, skipping");
            return DispatchReport::default();
        }
        let outcomes = join_all(
            self.endpoints
                .iter()
                .map(|url| self.deliver(url, payload)),
        )
        .await;
        DispatchReport { outcomes }
    }

    /// Runs [`dispatch`](Self::dispatch) in the background.
    pub fn spawn(&self, payload: WebhookPayload) -> JoinHandle<DispatchReport> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch(&payload).await })
    }

    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> EndpointOutcome {
        let result = retry_counted("webhook", &self.policy, |attempt| {
            debug!(url, attempt, message_id = %payload.message_id, "posting webhook");
            self.sender.post(url, payload)
        })
        .await;

        match result {
            Ok(done) => {
                info!(url, attempts = done.attempts, "webhook delivered");
                EndpointOutcome {
                    url: url.to_string(),
                    attempts: done.attempts,
                    delivered: true,
                    last_error: None,
                }
            }
            Err(e) => {
                let attempts = e.attempts();
                let last = e.into_last();
                error!(url, attempts, error = %last, "webhook delivery failed");
                EndpointOutcome {
                    url: url.to_string(),
                    attempts,
                    delivered: false,
                    last_error: Some(last.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_three_attempts_on_schedule() {
        let policy = WebhookConfig::default().retry_policy();

        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(5));
        assert_eq!(policy.base_delay(3), Duration::from_secs(10));
    }

    #[test]
    fn test_user_agent_names_the_crate() {
        assert!(USER_AGENT.starts_with("linkrelay/"));
    }
}
