//! Connection supervisor: an actor task that owns the session lifecycle.
//!
//! The supervisor runs the [`SessionMachine`] and carries out its effects.
//! Each connection attempt runs in its own task tagged with a
//! [`Generation`]. The task loads credentials, opens the session, and
//! forwards client events back to the actor. The actor drops anything
//! tagged with a generation other than the current one, so a torn-down
//! session can never drive the state machine.
//!
//! ```text
//!   SupervisorHandle ──commands──→ ┌──────────────────────┐
//!                                  │  supervisor actor    │──watch──→ status, active session
//!   attempt task (gen N) ──tagged──→│  SessionMachine      │──broadcast──→ LifecycleEvent
//!        │                         │  retry timer (one)   │──mpsc──→ InboundBatch
//!        └─ saves rotated creds    └──────────────────────┘──mpsc──→ ConnectionLog writer
//! ```

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use linkrelay_protocol::{AccountId, BatchKind, ConnectionLogEntry, Generation, InboundMessage};
use linkrelay_store::{AuthState, KvStore};
use linkrelay_transport::{ClientEvent, Connected, Connector, Session};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use tracing::{debug, error, info, warn};

use crate::{
    ConnectionLog, ConnectionState, Effect, LifecycleEvent, MachineEvent, ReconnectPolicy,
    SessionError, SessionMachine,
};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;
/// Capacity of the lifecycle broadcast channel.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A batch of messages from the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundBatch {
    pub generation: Generation,
    pub messages: Vec<InboundMessage>,
    pub kind: BatchKind,
}

/// The most recent pairing challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingChallenge {
    pub payload: String,
    pub issued_at: DateTime<Utc>,
}

/// Snapshot of the supervisor, published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub generation: Generation,
    pub account: Option<AccountId>,
    /// Present while waiting for the user to pair.
    pub pairing: Option<PairingChallenge>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub fatal_reason: Option<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            generation: Generation::default(),
            account: None,
            pairing: None,
            last_connected_at: None,
            fatal_reason: None,
        }
    }
}

/// The session currently in the `Connected` state.
pub struct ActiveSession<S> {
    pub generation: Generation,
    pub session: Arc<S>,
}

impl<S> Clone for ActiveSession<S> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            session: Arc::clone(&self.session),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running supervisor. Cheap to clone.
pub struct SupervisorHandle<S> {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SupervisorStatus>,
    session: watch::Receiver<Option<ActiveSession<S>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl<S> Clone for SupervisorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            session: self.session.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<S> SupervisorHandle<S> {
    /// Begins connecting. A no-op if an attempt is already live.
    ///
    /// # Errors
    /// [`SessionError::Fatal`] if the supervisor is waiting for a reset.
    pub async fn start(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        reply_rx.await.map_err(|_| SessionError::Unavailable)?
    }

    /// Tears down the session, deletes its stored credentials, and
    /// reconnects shortly after, which produces a fresh pairing challenge.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Reset { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        reply_rx.await.map_err(|_| SessionError::Unavailable)
    }

    /// Closes the session and stops the supervisor.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        reply_rx.await.map_err(|_| SessionError::Unavailable)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Waits until the status satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SupervisorStatus, SessionError>
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SessionError::Unavailable)?;
        Ok(status.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// The connected session, if any.
    pub fn session(&self) -> Option<ActiveSession<S>> {
        self.session.borrow().clone()
    }

    /// Resolves once the supervisor task has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    /// The connected session, or [`SessionError::NotConnected`].
    pub fn connected(&self) -> Result<ActiveSession<S>, SessionError> {
        self.session().ok_or(SessionError::NotConnected)
    }
}

// ---------------------------------------------------------------------------
// Attempt task
// ---------------------------------------------------------------------------

enum AttemptEvent<S> {
    Ready(Arc<S>),
    StartupFailed(String),
    Client(ClientEvent),
    Ended,
}

struct Tagged<S> {
    generation: Generation,
    event: AttemptEvent<S>,
}

struct Attempt<S> {
    generation: Generation,
    task: JoinHandle<()>,
    session: Option<Arc<S>>,
}

/// Loads credentials, opens a session, and forwards its events.
///
/// Credential rotations are saved here, in arrival order, before the next
/// event is read.
async fn run_attempt<C, K>(
    generation: Generation,
    connector: Arc<C>,
    auth: AuthState<K>,
    tx: mpsc::UnboundedSender<Tagged<C::Session>>,
) where
    C: Connector,
    K: KvStore,
{
    let send = |event| tx.send(Tagged { generation, event }).is_ok();

    let creds = match auth.load_or_init(|| connector.fresh_credentials()).await {
        Ok((creds, load)) => {
            debug!(%generation, ?load, "credentials ready");
            creds
        }
        Err(e) => {
            send(AttemptEvent::StartupFailed(e.to_string()));
            return;
        }
    };

    let Connected { session, mut events } = match connector.connect(creds, auth.keys()).await {
        Ok(connected) => connected,
        Err(e) => {
            send(AttemptEvent::StartupFailed(e.to_string()));
            return;
        }
    };

    let session = Arc::new(session);
    if !send(AttemptEvent::Ready(Arc::clone(&session))) {
        session.close().await;
        return;
    }

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::CredentialsUpdated(creds) => {
                if let Err(e) = auth.save_credentials(&creds).await {
                    error!(%generation, error = %e, "failed to persist rotated credentials");
                }
            }
            other => {
                if !send(AttemptEvent::Client(other)) {
                    return;
                }
            }
        }
    }
    send(AttemptEvent::Ended);
}

/// Writes connection log rows in order without blocking the actor.
async fn run_log_writer<L: ConnectionLog>(log: Arc<L>, mut rx: mpsc::UnboundedReceiver<ConnectionLogEntry>) {
    while let Some(entry) = rx.recv().await {
        let event_type = entry.event_type.clone();
        if let Err(e) = log.record(entry).await {
            warn!(%event_type, error = %e, "failed to write connection log");
        }
    }
}

async fn retry_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Supervisor actor
// ---------------------------------------------------------------------------

/// The actor behind a [`SupervisorHandle`].
pub struct ConnectionSupervisor<C: Connector, K: KvStore> {
    machine: SessionMachine,
    connector: Arc<C>,
    auth: AuthState<K>,
    commands: mpsc::Receiver<Command>,
    attempt_tx: mpsc::UnboundedSender<Tagged<C::Session>>,
    attempt_rx: mpsc::UnboundedReceiver<Tagged<C::Session>>,
    current: Option<Attempt<C::Session>>,
    retry: Option<Pin<Box<Sleep>>>,
    inbound: mpsc::UnboundedSender<InboundBatch>,
    log: mpsc::UnboundedSender<ConnectionLogEntry>,
    status: watch::Sender<SupervisorStatus>,
    session: watch::Sender<Option<ActiveSession<C::Session>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    account: Option<AccountId>,
    pairing: Option<PairingChallenge>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl<C: Connector, K: KvStore> ConnectionSupervisor<C, K> {
    /// Spawns the supervisor and returns its handle plus the stream of
    /// message batches from whichever session is current.
    ///
    /// Nothing connects until [`SupervisorHandle::start`] is called.
    pub fn spawn<L: ConnectionLog>(
        policy: ReconnectPolicy,
        connector: Arc<C>,
        auth: AuthState<K>,
        log: Arc<L>,
    ) -> (
        SupervisorHandle<C::Session>,
        mpsc::UnboundedReceiver<InboundBatch>,
    ) {
        let (actor, handle, inbound_rx, log_rx) = Self::build(policy, connector, auth);
        tokio::spawn(run_log_writer(log, log_rx));
        tokio::spawn(actor.run());
        (handle, inbound_rx)
    }

    /// Wires the actor's channels without spawning anything.
    #[allow(clippy::type_complexity)]
    fn build(
        policy: ReconnectPolicy,
        connector: Arc<C>,
        auth: AuthState<K>,
    ) -> (
        Self,
        SupervisorHandle<C::Session>,
        mpsc::UnboundedReceiver<InboundBatch>,
        mpsc::UnboundedReceiver<ConnectionLogEntry>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let (session_tx, session_rx) = watch::channel(None);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        let actor = Self {
            machine: SessionMachine::new(policy),
            connector,
            auth,
            commands: command_rx,
            attempt_tx,
            attempt_rx,
            current: None,
            retry: None,
            inbound: inbound_tx,
            log: log_tx,
            status: status_tx,
            session: session_tx,
            lifecycle: lifecycle_tx.clone(),
            account: None,
            pairing: None,
            last_connected_at: None,
        };
        let handle = SupervisorHandle {
            commands: command_tx,
            status: status_rx,
            session: session_rx,
            lifecycle: lifecycle_tx,
        };
        (actor, handle, inbound_rx, log_rx)
    }

    async fn run(mut self) {
        info!("connection supervisor started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Start { reply }) => {
                        let result = self.handle_start().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Reset { reply }) => {
                        self.apply(MachineEvent::Reset).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.apply(MachineEvent::Shutdown).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.apply(MachineEvent::Shutdown).await;
                        break;
                    }
                },
                Some(tagged) = self.attempt_rx.recv() => {
                    self.handle_attempt_event(tagged).await;
                }
                () = retry_elapsed(&mut self.retry) => {
                    self.retry = None;
                    self.apply(MachineEvent::RetryTimerFired).await;
                }
            }
        }

        info!("connection supervisor stopped");
    }

    async fn handle_start(&mut self) -> Result<(), SessionError> {
        if let Some(reason) = self.machine.fatal_reason() {
            return Err(SessionError::Fatal(reason.to_string()));
        }
        self.apply(MachineEvent::Start).await;
        Ok(())
    }

    async fn handle_attempt_event(&mut self, tagged: Tagged<C::Session>) {
        let Tagged { generation, event } = tagged;
        let Some(current) = self.current.as_mut().filter(|a| a.generation == generation) else {
            debug!(%generation, "dropping event from stale session");
            if let AttemptEvent::Ready(session) = event {
                session.close().await;
            }
            return;
        };

        match event {
            AttemptEvent::Ready(session) => {
                current.session = Some(session);
            }
            AttemptEvent::StartupFailed(message) => {
                self.apply(MachineEvent::StartupFailed { message }).await;
            }
            AttemptEvent::Ended => {
                self.apply(MachineEvent::Closed {
                    status_code: None,
                    reason: "event stream ended".into(),
                })
                .await;
            }
            AttemptEvent::Client(event) => self.handle_client_event(generation, event).await,
        }
    }

    async fn handle_client_event(&mut self, generation: Generation, event: ClientEvent) {
        match event {
            ClientEvent::PairingChallenge(payload) => {
                self.apply(MachineEvent::PairingChallenge(payload)).await;
            }
            ClientEvent::Connecting => debug!(%generation, "client connecting"),
            ClientEvent::Open { account } => {
                self.apply(MachineEvent::Opened { account }).await;
            }
            ClientEvent::Closed {
                status_code,
                reason,
            } => {
                self.apply(MachineEvent::Closed {
                    status_code,
                    reason,
                })
                .await;
            }
            ClientEvent::Messages { messages, kind } => {
                let _ = self.inbound.send(InboundBatch {
                    generation,
                    messages,
                    kind,
                });
            }
            // Saved by the attempt task.
            ClientEvent::CredentialsUpdated(_) => {}
        }
    }

    async fn apply(&mut self, event: MachineEvent) {
        for effect in self.machine.apply(event) {
            self.execute(effect).await;
        }
        self.publish_status();
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::CancelRetry => self.retry = None,
            Effect::TearDown => self.tear_down().await,
            Effect::Connect { generation } => self.spawn_attempt(generation),
            Effect::ScheduleRetry { delay, attempt } => {
                info!(delay_ms = delay.as_millis() as u64, attempt, "reconnect scheduled");
                self.retry = Some(Box::pin(sleep(delay)));
            }
            Effect::Emit(event) => {
                self.observe(&event);
                let _ = self.lifecycle.send(event);
            }
            Effect::Log(entry) => {
                let _ = self.log.send(entry);
            }
            Effect::ClearCredentials => {
                if let Err(e) = self.auth.clear().await {
                    error!(error = %e, "failed to clear stored credentials");
                }
            }
        }
    }

    fn spawn_attempt(&mut self, generation: Generation) {
        let task = tokio::spawn(run_attempt(
            generation,
            Arc::clone(&self.connector),
            self.auth.clone(),
            self.attempt_tx.clone(),
        ));
        self.current = Some(Attempt {
            generation,
            task,
            session: None,
        });
    }

    async fn tear_down(&mut self) {
        self.session.send_replace(None);
        let Some(attempt) = self.current.take() else {
            return;
        };
        attempt.task.abort();
        if let Some(session) = attempt.session {
            session.close().await;
        }
        debug!(generation = %attempt.generation, "session torn down");
    }

    /// Tracks what the status snapshot reports beyond the machine itself.
    fn observe(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PairingRequired { payload } => {
                self.pairing = Some(PairingChallenge {
                    payload: payload.clone(),
                    issued_at: Utc::now(),
                });
            }
            LifecycleEvent::Connected {
                account,
                generation,
            } => {
                self.account = Some(account.clone());
                self.pairing = None;
                self.last_connected_at = Some(Utc::now());
                let session = self
                    .current
                    .as_ref()
                    .filter(|a| a.generation == *generation)
                    .and_then(|a| a.session.clone());
                if let Some(session) = session {
                    self.session.send_replace(Some(ActiveSession {
                        generation: *generation,
                        session,
                    }));
                }
            }
            LifecycleEvent::Disconnected { .. } | LifecycleEvent::Fatal { .. } => {
                self.session.send_replace(None);
            }
            LifecycleEvent::Reset => {
                self.session.send_replace(None);
                self.account = None;
                self.pairing = None;
            }
        }
    }

    fn publish_status(&self) {
        let state = self.machine.state();
        let status = SupervisorStatus {
            state,
            attempts: self.machine.attempts(),
            generation: self.machine.generation(),
            account: self.account.clone(),
            pairing: self
                .pairing
                .clone()
                .filter(|_| state == ConnectionState::AwaitingPairing),
            last_connected_at: self.last_connected_at,
            fatal_reason: self.machine.fatal_reason().map(str::to_string),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use linkrelay_store::{CredentialStore, MemoryKvStore};
    use linkrelay_transport::{MemoryConnector, MemorySession};
    use serde_json::json;

    use super::*;

    type Actor = ConnectionSupervisor<MemoryConnector, MemoryKvStore>;

    fn actor(connector: &MemoryConnector) -> (Actor, SupervisorHandle<MemorySession>) {
        let auth = AuthState::new(CredentialStore::new(Arc::new(MemoryKvStore::new()), "main"));
        let (actor, handle, _, _) =
            Actor::build(ReconnectPolicy::default(), Arc::new(connector.clone()), auth);
        (actor, handle)
    }

    /// Starts generation 1, drops it with a transient close, and fires the
    /// retry so generation 2 is the current attempt.
    async fn on_second_generation(actor: &mut Actor) {
        actor.apply(MachineEvent::Start).await;
        actor
            .apply(MachineEvent::Closed {
                status_code: Some(428),
                reason: "connection closed".into(),
            })
            .await;
        actor.apply(MachineEvent::RetryTimerFired).await;
        assert_eq!(actor.machine.generation(), Generation(2));
    }

    fn snapshot(actor: &Actor) -> (ConnectionState, u32, Generation) {
        (
            actor.machine.state(),
            actor.machine.attempts(),
            actor.machine.generation(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_close_leaves_machine_unchanged() {
        let connector = MemoryConnector::new();
        let (mut actor, handle) = actor(&connector);
        on_second_generation(&mut actor).await;
        let before = snapshot(&actor);

        actor
            .handle_attempt_event(Tagged {
                generation: Generation(1),
                event: AttemptEvent::Client(ClientEvent::Closed {
                    status_code: Some(401),
                    reason: "logged out".into(),
                }),
            })
            .await;

        assert_eq!(snapshot(&actor), before);
        assert_eq!(before.0, ConnectionState::Connecting);
        assert_eq!(handle.status().state, ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_open_does_not_connect() {
        let connector = MemoryConnector::new();
        let (mut actor, handle) = actor(&connector);
        on_second_generation(&mut actor).await;
        let before = snapshot(&actor);

        actor
            .handle_attempt_event(Tagged {
                generation: Generation(1),
                event: AttemptEvent::Client(ClientEvent::Open {
                    account: AccountId("15550001111:1@s.whatsapp.net".into()),
                }),
            })
            .await;

        assert_eq!(snapshot(&actor), before);
        assert!(handle.session().is_none());
        assert_eq!(handle.status().account, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ready_session_is_closed() {
        let connector = MemoryConnector::new();
        let (mut actor, handle) = actor(&connector);
        on_second_generation(&mut actor).await;
        let stale = connector
            .connect(json!({}), actor.auth.keys())
            .await
            .unwrap()
            .session;

        actor
            .handle_attempt_event(Tagged {
                generation: Generation(1),
                event: AttemptEvent::Ready(Arc::new(stale.clone())),
            })
            .await;

        assert!(stale.is_closed());
        assert!(handle.session().is_none());
        assert!(
            actor
                .current
                .as_ref()
                .is_some_and(|a| a.generation == Generation(2) && a.session.is_none())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_ready_session_is_kept_open() {
        let connector = MemoryConnector::new();
        let (mut actor, _handle) = actor(&connector);
        on_second_generation(&mut actor).await;
        let fresh = connector
            .connect(json!({}), actor.auth.keys())
            .await
            .unwrap()
            .session;

        actor
            .handle_attempt_event(Tagged {
                generation: Generation(2),
                event: AttemptEvent::Ready(Arc::new(fresh.clone())),
            })
            .await;

        assert!(!fresh.is_closed());
        assert!(actor.current.as_ref().is_some_and(|a| a.session.is_some()));
    }
}
