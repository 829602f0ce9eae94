//! Scripted in-process client.
//!
//! Each call to [`Connector::connect`] consumes the next [`Script`]: either
//! a list of events pre-loaded into the new session's channel, or a startup
//! failure. Once the scripts run out, sessions open silently and tests
//! drive them with [`MemoryConnector::emit`].
//!
//! Everything the relay does to a session (sends, receipts, presence,
//! closes) is recorded for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use linkrelay_protocol::{OutboundContent, SentMessage, buffer_value};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ClientEvent, Connected, Connector, EVENT_CHANNEL_CAPACITY, KeyStore, Presence, Session,
    TransportError,
};

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Open a session and queue these events on it.
    Events(Vec<ClientEvent>),
    /// Fail setup with this message.
    StartupError(String),
}

#[derive(Default)]
struct Inner {
    scripts: VecDeque<Script>,
    connects: Vec<Value>,
    live: Option<mpsc::Sender<ClientEvent>>,
    sent: Vec<(String, OutboundContent)>,
    reads: Vec<(String, String)>,
    presences: Vec<Presence>,
    closes: usize,
    minted: u8,
    next_message: u64,
    fail_sends: bool,
}

/// In-memory [`Connector`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script for a future `connect` call.
    pub fn with_script(self, script: Script) -> Self {
        self.push_script(script);
        self
    }

    pub fn push_script(&self, script: Script) {
        self.lock().scripts.push_back(script);
    }

    /// Pushes an event onto the most recent session's stream.
    ///
    /// Returns `false` if there is no session or its receiver is gone.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let Some(tx) = self.lock().live.clone() else {
            return false;
        };
        tx.try_send(event).is_ok()
    }

    /// Makes every subsequent send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    /// Credentials passed to each `connect` call, in order.
    pub fn credentials_seen(&self) -> Vec<Value> {
        self.lock().connects.clone()
    }

    pub fn sent(&self) -> Vec<(String, OutboundContent)> {
        self.lock().sent.clone()
    }

    /// `(chat_id, message_id)` pairs marked read.
    pub fn reads(&self) -> Vec<(String, String)> {
        self.lock().reads.clone()
    }

    pub fn presences(&self) -> Vec<Presence> {
        self.lock().presences.clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connector for MemoryConnector {
    type Session = MemorySession;

    fn fresh_credentials(&self) -> Value {
        let mut inner = self.lock();
        inner.minted = inner.minted.wrapping_add(1);
        let seed = inner.minted;
        let key = |tag: u8| buffer_value(&[seed, tag, 0, 0, 0, 0, 0, 0]);
        json!({
            "noiseKey": { "private": key(1), "public": key(2) },
            "signedIdentityKey": { "private": key(3), "public": key(4) },
            "signedPreKey": {
                "keyPair": { "private": key(5), "public": key(6) },
                "keyId": 1
            },
            "advSecretKey": format!("adv-secret-{seed}"),
            "registrationId": u32::from(seed),
            "me": null
        })
    }

    async fn connect<K: KeyStore + Clone>(
        &self,
        creds: Value,
        _keys: K,
    ) -> Result<Connected<MemorySession>, TransportError> {
        let mut inner = self.lock();
        inner.connects.push(creds);
        let script = inner
            .scripts
            .pop_front()
            .unwrap_or(Script::Events(Vec::new()));

        let events = match script {
            Script::StartupError(msg) => {
                debug!(error = %msg, "memory connector: scripted startup failure");
                return Err(TransportError::Startup(msg));
            }
            Script::Events(events) => events,
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for event in events {
            tx.try_send(event)
                .map_err(|e| TransportError::ConnectionClosed(e.to_string()))?;
        }
        // Replacing the sender ends the previous session's stream.
        inner.live = Some(tx);

        debug!(connects = inner.connects.len(), "memory connector: session opened");
        Ok(Connected {
            session: MemorySession {
                connector: self.clone(),
                closed: Arc::new(AtomicBool::new(false)),
            },
            events: rx,
        })
    }
}

/// Session handle produced by [`MemoryConnector`].
#[derive(Clone)]
pub struct MemorySession {
    connector: MemoryConnector,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

impl Session for MemorySession {
    async fn send(
        &self,
        target: &str,
        content: OutboundContent,
    ) -> Result<SentMessage, TransportError> {
        self.check_open()?;
        let mut inner = self.connector.lock();
        if inner.fail_sends {
            return Err(TransportError::SendFailed("scripted failure".into()));
        }
        inner.next_message += 1;
        let id = format!("MEM{:06}", inner.next_message);
        inner.sent.push((target.to_string(), content));
        Ok(SentMessage {
            id,
            target: target.to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<(), TransportError> {
        self.check_open()?;
        self.connector
            .lock()
            .reads
            .push((chat_id.to_string(), message_id.to_string()));
        Ok(())
    }

    async fn send_presence(&self, presence: Presence) -> Result<(), TransportError> {
        self.check_open()?;
        self.connector.lock().presences.push(presence);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connector.lock().closes += 1;
        }
    }
}
