//! Runs a relay over the scripted in-memory client.
//!
//! Configuration comes from flags, the environment, or `.env`, exactly as a
//! production binary would read it. Credentials and message records stay in
//! memory; webhooks go to `WEBHOOK_URLS` if any are set.
//!
//! ```text
//! WEBHOOK_URLS=http://localhost:9000/hook cargo run -p scripted-relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use linkrelay::delivery::{HttpWebhookSender, WebhookDispatcher};
use linkrelay::prelude::*;
use linkrelay::protocol::{AccountId, BatchKind, InboundMessage, MessageContent};
use linkrelay::session::MemoryConnectionLog;
use linkrelay::store::{AuthState, CredentialStore, MemoryKvStore};
use linkrelay::transport::{ClientEvent, MemoryConnector, Script};
use linkrelay::{MemoryMessageSink, NoArchive, RelayParts};
use tracing::info;

const CHAT: &str = "15551234567@s.whatsapp.net";

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let config = RelayConfig::load();
    config.validate()?;
    linkrelay::logging::init(&config.log_level)?;

    let connector = MemoryConnector::new().with_script(Script::Events(vec![
        ClientEvent::PairingChallenge("2@demo-pairing-ref".into()),
        ClientEvent::Open {
            account: AccountId("15550001111:1@s.whatsapp.net".into()),
        },
    ]));

    let webhook_config = config.webhook_config();
    let sink = MemoryMessageSink::new();
    let relay = RelayBuilder::from_config(&config).spawn(RelayParts {
        connector: Arc::new(connector.clone()),
        auth: AuthState::new(CredentialStore::new(
            Arc::new(MemoryKvStore::new()),
            config.session_id.as_str(),
        )),
        log: Arc::new(MemoryConnectionLog::new()),
        sink: Arc::new(sink.clone()),
        archive: Arc::new(NoArchive),
        webhooks: WebhookDispatcher::new(
            config.webhook_urls().map(str::to_string).collect(),
            Arc::new(HttpWebhookSender::new(webhook_config.timeout)?),
            &webhook_config,
        ),
    });

    relay.start().await?;
    let status = relay
        .supervisor()
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await?;
    info!(account = ?status.account, generation = %status.generation, "demo session connected");

    connector.emit(ClientEvent::Messages {
        messages: vec![InboundMessage {
            id: "DEMO1".into(),
            chat_id: CHAT.into(),
            from_me: false,
            push_name: Some("Demo".into()),
            timestamp: None,
            content: MessageContent::Conversation {
                text: "ping".into(),
            },
            reply: None,
        }],
        kind: BatchKind::Notify,
    });

    let sent = relay.send(&OutboundMessage::text(CHAT, "pong")).await?;
    info!(message_id = %sent.id, "reply sent");

    // Leaves time for the background webhook dispatch.
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(records = sink.records().len(), "message records stored");

    relay.shutdown().await
}
