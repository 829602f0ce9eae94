//! `Relay`: wires the supervisor, queue, presence, and webhooks together.
//!
//! ```text
//!             ┌──────────────── Relay ────────────────┐
//! send() ───→ │ DeliveryQueue ──→ active Session      │
//!             │                                       │
//!             │ ConnectionSupervisor ──InboundBatch──→ inbound relay ──→ MessageSink
//!             │        │                              │        └──→ mark_read, WebhookDispatcher
//!             │        └── lifecycle ──→ PresenceKeeper│
//!             └───────────────────────────────────────┘
//! ```

use std::sync::Arc;

use linkrelay_delivery::{
    DeliveryQueue, HttpWebhookSender, QueueConfig, QueueStats, WebhookDispatcher, WebhookSender,
};
use linkrelay_protocol::{
    Generation, InboundMessage, MessageContent, MessageRecord, OutboundMessage, SentMessage,
    WebhookPayload,
};
use linkrelay_session::{
    ConnectionLog, ConnectionState, ConnectionSupervisor, InboundBatch, PresenceConfig,
    PresenceKeeper, ReconnectPolicy, SessionError, SupervisorHandle, SupervisorStatus,
};
use linkrelay_store::{AuthState, CredentialStore, KvStore, PostgrestStore};
use linkrelay_transport::{Connector, Session};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{MediaArchive, MessageSink, NoArchive, PostgrestRows, RelayConfig, RelayError};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// The collaborators a relay runs on.
pub struct RelayParts<C, K, L, M, A, W> {
    pub connector: Arc<C>,
    pub auth: AuthState<K>,
    pub log: Arc<L>,
    pub sink: Arc<M>,
    pub archive: Arc<A>,
    pub webhooks: WebhookDispatcher<W>,
}

/// Timing settings for a [`Relay`]. Defaults are the production values.
#[derive(Debug, Clone, Default)]
pub struct RelayBuilder {
    policy: ReconnectPolicy,
    queue: QueueConfig,
    presence: PresenceConfig,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes queue and presence timings from `config`.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            queue: config.queue_config(),
            presence: config.presence_config(),
        }
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn presence_config(mut self, config: PresenceConfig) -> Self {
        self.presence = config;
        self
    }

    /// Spawns every task. Nothing connects until [`Relay::start`].
    pub fn spawn<C, K, L, M, A, W>(self, parts: RelayParts<C, K, L, M, A, W>) -> Relay<C::Session, M>
    where
        C: Connector,
        K: KvStore,
        L: ConnectionLog,
        M: MessageSink,
        A: MediaArchive,
        W: WebhookSender,
    {
        let (supervisor, batches) =
            ConnectionSupervisor::spawn(self.policy, parts.connector, parts.auth, parts.log);
        let presence = PresenceKeeper::spawn(supervisor.clone(), self.presence);
        let inbound = InboundRelay {
            supervisor: supervisor.clone(),
            sink: Arc::clone(&parts.sink),
            archive: parts.archive,
            webhooks: parts.webhooks,
        };
        let inbound = tokio::spawn(inbound.run(batches));

        Relay {
            supervisor,
            queue: DeliveryQueue::spawn(self.queue),
            sink: parts.sink,
            presence,
            inbound,
        }
    }
}

/// A relay backed by the REST key-value service.
pub type PostgrestRelay<S> = Relay<S, PostgrestRows>;

/// Builds the production relay from `config`: credentials, message records,
/// and connection logs in the REST service; webhooks over HTTP.
pub fn spawn_with_postgrest<C: Connector>(
    config: &RelayConfig,
    connector: Arc<C>,
) -> Result<PostgrestRelay<C::Session>, RelayError> {
    config.validate()?;
    let pg = config
        .postgrest()
        .ok_or_else(|| RelayError::Config("STORE_URL and STORE_KEY are required".into()))?;
    let store = PostgrestStore::new(pg)?;

    let auth = AuthState::new(CredentialStore::new(
        Arc::new(store.clone()),
        config.session_id.as_str(),
    ));
    let webhook_config = config.webhook_config();
    let sender = Arc::new(HttpWebhookSender::new(webhook_config.timeout)?);
    let endpoints = config.webhook_urls().map(str::to_string).collect();

    info!(
        session_id = %config.session_id,
        webhooks = config.webhook_urls().count(),
        "relay configured"
    );
    Ok(RelayBuilder::from_config(config).spawn(RelayParts {
        connector,
        auth,
        log: Arc::new(PostgrestRows::new(store.clone(), &config.connection_log_table)),
        sink: Arc::new(PostgrestRows::new(store, &config.messages_table)),
        archive: Arc::new(NoArchive),
        webhooks: WebhookDispatcher::new(endpoints, sender, &webhook_config),
    }))
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// A running relay.
pub struct Relay<S, M> {
    supervisor: SupervisorHandle<S>,
    queue: DeliveryQueue,
    sink: Arc<M>,
    presence: PresenceKeeper,
    inbound: JoinHandle<()>,
}

impl<S: Session, M: MessageSink> Relay<S, M> {
    /// Starts connecting.
    pub async fn start(&self) -> Result<(), RelayError> {
        Ok(self.supervisor.start().await?)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    pub fn supervisor(&self) -> &SupervisorHandle<S> {
        &self.supervisor
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Drops the stored credentials and re-pairs.
    pub async fn reset(&self) -> Result<(), RelayError> {
        Ok(self.supervisor.reset().await?)
    }

    /// Sends a message through the delivery queue.
    ///
    /// # Errors
    /// - [`RelayError::Protocol`] if the message breaks the send contract.
    /// - [`SessionError::NotConnected`] / [`SessionError::Fatal`] if there
    ///   is no connected session, either now or when the job runs.
    /// - [`RelayError::Transport`] if the session rejects the send.
    pub async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, RelayError> {
        let content = message.content()?;
        let status = self.supervisor.status();
        if status.state != ConnectionState::Connected {
            return Err(match status.fatal_reason {
                Some(reason) => SessionError::Fatal(reason),
                None => SessionError::NotConnected,
            }
            .into());
        }

        let supervisor = self.supervisor.clone();
        let sink = Arc::clone(&self.sink);
        let target = message.target.clone();
        let sent = self
            .queue
            .enqueue(move || async move {
                let active = supervisor.connected()?;
                let sent = active.session.send(&target, content.clone()).await?;
                let record = MessageRecord::outbound(&sent, &content);
                if let Err(e) = sink.save(&record).await {
                    warn!(message_id = %sent.id, error = %e, "failed to record outbound message");
                }
                Ok::<_, RelayError>(sent)
            })
            .await?;

        info!(message_id = %sent.id, target = %sent.target, "message sent");
        Ok(sent)
    }

    /// Stops presence, closes the session, and waits for the inbound relay
    /// to drain.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        self.presence.stop();
        self.supervisor.shutdown().await?;
        if let Err(e) = self.inbound.await {
            warn!(error = %e, "inbound relay ended abnormally");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound relay
// ---------------------------------------------------------------------------

/// Records inbound messages, acknowledges them, and forwards them.
struct InboundRelay<S, M, A, W> {
    supervisor: SupervisorHandle<S>,
    sink: Arc<M>,
    archive: Arc<A>,
    webhooks: WebhookDispatcher<W>,
}

impl<S, M, A, W> InboundRelay<S, M, A, W>
where
    S: Session,
    M: MessageSink,
    A: MediaArchive,
    W: WebhookSender,
{
    async fn run(self, mut batches: mpsc::UnboundedReceiver<InboundBatch>) {
        while let Some(batch) = batches.recv().await {
            self.relay_batch(batch).await;
        }
        debug!("inbound relay stopped");
    }

    async fn relay_batch(&self, batch: InboundBatch) {
        if !batch.kind.is_relayed() {
            debug!(kind = ?batch.kind, count = batch.messages.len(), "ignoring batch");
            return;
        }
        for message in &batch.messages {
            if message.is_bookkeeping() {
                continue;
            }
            self.relay_message(batch.generation, message).await;
        }
    }

    async fn relay_message(&self, generation: Generation, message: &InboundMessage) {
        let archived = match message.content {
            MessageContent::Media { .. } => match self.archive.archive(message).await {
                Ok(archived) => archived,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "media archive failed");
                    None
                }
            },
            _ => None,
        };

        let record = MessageRecord::inbound(message, archived);
        info!(
            message_id = %record.message_id,
            message_type = %record.message_type,
            from_me = record.from_me,
            "message received"
        );
        if let Err(e) = self.sink.save(&record).await {
            error!(message_id = %record.message_id, error = %e, "failed to save message record");
        }

        if message.from_me {
            debug!(message_id = %record.message_id, "own message, not forwarded");
            return;
        }

        match self.supervisor.session() {
            Some(active) if active.generation == generation => {
                if let Err(e) = active.session.mark_read(&message.chat_id, &message.id).await {
                    warn!(message_id = %message.id, error = %e, "failed to send read receipt");
                }
            }
            _ => debug!(message_id = %message.id, "session replaced, skipping read receipt"),
        }

        self.webhooks.spawn(WebhookPayload::from(&record));
    }
}
