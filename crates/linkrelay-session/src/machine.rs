//! The connection state machine, as a pure transition function.
//!
//! [`SessionMachine::apply`] takes one [`MachineEvent`] and returns the
//! [`Effect`]s the supervisor must carry out. It never performs I/O, so
//! every transition is testable without a network.
//!
//! ```text
//!                 start / retry timer
//!  Disconnected ──────────────────────→ Connecting ──(pairing)──→ AwaitingPairing
//!       ▲                                   │                          │
//!       │ disconnect                        └────────(open)────────────┤
//!       │ (retry scheduled)                                            ▼
//!       └──────────────────────────────────────────────────────── Connected
//!
//!  any non-terminal ──(bounded class exhausted)──→ Fatal ──(reset)──→ Disconnected
//! ```

use std::fmt;
use std::time::Duration;

use linkrelay_protocol::{AccountId, ConnectionLogEntry, Generation};
use tracing::{error, info, warn};

use crate::{DisconnectClass, ReconnectPolicy, StartupFailureClass};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingPairing,
    Connected,
    /// Terminal until an explicit reset.
    Fatal,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// An attempt is in flight or established.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::AwaitingPairing | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::AwaitingPairing => "AWAITING_PAIRING",
            Self::Connected => "CONNECTED",
            Self::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Events and effects
// ---------------------------------------------------------------------------

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Start,
    PairingChallenge(String),
    Opened { account: AccountId },
    Closed { status_code: Option<u16>, reason: String },
    /// Connection setup failed before the session produced events.
    StartupFailed { message: String },
    RetryTimerFired,
    Reset,
    Shutdown,
}

/// Notifications for presence, persistence, and boundary collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    PairingRequired { payload: String },
    Connected { account: AccountId, generation: Generation },
    Disconnected { status_code: Option<u16>, reason: String },
    Fatal { reason: String },
    Reset,
}

/// Work the supervisor performs, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Drop the pending retry timer, if any.
    CancelRetry,
    /// Close the current session and stop its event forwarding.
    TearDown,
    /// Open a new session tagged with `generation`.
    Connect { generation: Generation },
    /// Arm the single retry timer.
    ScheduleRetry { delay: Duration, attempt: u32 },
    Emit(LifecycleEvent),
    Log(ConnectionLogEntry),
    /// Delete every stored credential for the session.
    ClearCredentials,
}

// ---------------------------------------------------------------------------
// SessionMachine
// ---------------------------------------------------------------------------

/// Connection state, attempt counter, and generation.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: ConnectionState,
    attempts: u32,
    generation: Generation,
    policy: ReconnectPolicy,
    fatal_reason: Option<String>,
}

impl SessionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            generation: Generation::default(),
            policy: policy.validated(),
            fatal_reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal_reason.as_deref()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Advances the machine by one event.
    pub fn apply(&mut self, event: MachineEvent) -> Vec<Effect> {
        match event {
            MachineEvent::Start => match self.state {
                ConnectionState::Disconnected => self.begin_attempt(),
                // Already live, or fatal and waiting for a reset.
                _ => Vec::new(),
            },
            MachineEvent::RetryTimerFired => match self.state {
                ConnectionState::Disconnected => self.begin_attempt(),
                _ => Vec::new(),
            },
            MachineEvent::PairingChallenge(payload) => self.on_pairing(payload),
            MachineEvent::Opened { account } => self.on_opened(account),
            MachineEvent::Closed {
                status_code,
                reason,
            } => self.on_closed(status_code, reason),
            MachineEvent::StartupFailed { message } => self.on_startup_failed(message),
            MachineEvent::Reset => self.on_reset(),
            MachineEvent::Shutdown => {
                self.state = ConnectionState::Disconnected;
                vec![
                    Effect::CancelRetry,
                    Effect::TearDown,
                    Effect::Emit(LifecycleEvent::Disconnected {
                        status_code: None,
                        reason: "shutdown".into(),
                    }),
                ]
            }
        }
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        self.generation = self.generation.next();
        self.state = ConnectionState::Connecting;
        info!(
            generation = %self.generation,
            attempt = self.attempts + 1,
            "starting connection"
        );
        vec![
            Effect::CancelRetry,
            Effect::TearDown,
            Effect::Connect {
                generation: self.generation,
            },
        ]
    }

    fn on_pairing(&mut self, payload: String) -> Vec<Effect> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::AwaitingPairing
        ) {
            return Vec::new();
        }
        self.state = ConnectionState::AwaitingPairing;
        self.attempts = 0;
        info!("pairing required");
        vec![Effect::Emit(LifecycleEvent::PairingRequired { payload })]
    }

    fn on_opened(&mut self, account: AccountId) -> Vec<Effect> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::AwaitingPairing
        ) {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        info!(%account, generation = %self.generation, "connected");
        vec![
            Effect::Emit(LifecycleEvent::Connected {
                account,
                generation: self.generation,
            }),
            Effect::Log(ConnectionLogEntry::connected()),
        ]
    }

    fn on_closed(&mut self, status_code: Option<u16>, reason: String) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        let class = DisconnectClass::of(status_code);
        warn!(code = ?status_code, %reason, %class, attempts = self.attempts, "disconnected");

        let mut effects = vec![
            Effect::Log(ConnectionLogEntry::disconnect(status_code, &reason, self.attempts)),
            Effect::TearDown,
            Effect::Emit(LifecycleEvent::Disconnected {
                status_code,
                reason: reason.clone(),
            }),
        ];
        self.state = ConnectionState::Disconnected;

        match class {
            DisconnectClass::RestartRequired => {
                self.attempts = 0;
                effects.push(Effect::ScheduleRetry {
                    delay: self.policy.restart_delay,
                    attempt: 0,
                });
            }
            DisconnectClass::SessionRejected => {
                let limit = self.policy.rejected_limit;
                effects.extend(self.bounded_retry(limit, || {
                    format!("session rejected (code {}): {reason}", status_code.unwrap_or(0))
                }));
            }
            DisconnectClass::Transient | DisconnectClass::Unknown => {
                effects.push(self.backoff_retry());
            }
        }
        effects
    }

    fn on_startup_failed(&mut self, message: String) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        let class = StartupFailureClass::of(&message);
        error!(error = %message, ?class, "connection startup failed");
        self.state = ConnectionState::Disconnected;

        let mut effects = vec![Effect::TearDown];
        match class {
            StartupFailureClass::Integrity => {
                let limit = self.policy.integrity_limit;
                effects.extend(
                    self.bounded_retry(limit, || format!("stored session data unusable: {message}")),
                );
            }
            StartupFailureClass::Other => effects.push(self.backoff_retry()),
        }
        effects
    }

    fn on_reset(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.fatal_reason = None;
        warn!("session reset requested");
        vec![
            Effect::CancelRetry,
            Effect::TearDown,
            Effect::ClearCredentials,
            Effect::Emit(LifecycleEvent::Reset),
            Effect::ScheduleRetry {
                delay: self.policy.reset_restart_delay,
                attempt: 0,
            },
        ]
    }

    /// Counts the attempt and schedules backoff while within `limit`,
    /// otherwise goes FATAL.
    fn bounded_retry(&mut self, limit: u32, reason: impl FnOnce() -> String) -> Vec<Effect> {
        self.attempts += 1;
        if self.attempts <= limit {
            vec![self.backoff_delay()]
        } else {
            let reason = reason();
            error!(attempts = self.attempts, %reason, "retries exhausted, manual reset required");
            self.state = ConnectionState::Fatal;
            self.fatal_reason = Some(reason.clone());
            vec![Effect::CancelRetry, Effect::Emit(LifecycleEvent::Fatal { reason })]
        }
    }

    fn backoff_retry(&mut self) -> Effect {
        self.attempts += 1;
        self.backoff_delay()
    }

    fn backoff_delay(&self) -> Effect {
        Effect::ScheduleRetry {
            delay: self.policy.backoff().delay_for(self.attempts),
            attempt: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(ReconnectPolicy::default())
    }

    fn closed(code: Option<u16>) -> MachineEvent {
        MachineEvent::Closed {
            status_code: code,
            reason: "test".into(),
        }
    }

    fn scheduled(effects: &[Effect]) -> Option<(Duration, u32)> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleRetry { delay, attempt } => Some((*delay, *attempt)),
            _ => None,
        })
    }

    fn connect_and_close(m: &mut SessionMachine, code: Option<u16>) -> Vec<Effect> {
        m.apply(MachineEvent::RetryTimerFired);
        m.apply(closed(code))
    }

    #[test]
    fn test_start_from_disconnected_connects_with_new_generation() {
        let mut m = machine();
        let effects = m.apply(MachineEvent::Start);

        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.generation(), Generation(1));
        assert!(effects.contains(&Effect::Connect {
            generation: Generation(1)
        }));
    }

    #[test]
    fn test_start_while_connecting_is_noop() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        assert!(m.apply(MachineEvent::Start).is_empty());
        assert_eq!(m.generation(), Generation(1));
    }

    #[test]
    fn test_pairing_resets_attempts() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        connect_and_close(&mut m, Some(428));
        connect_and_close(&mut m, Some(428));
        m.apply(MachineEvent::RetryTimerFired);
        assert_eq!(m.attempts(), 2);

        let effects = m.apply(MachineEvent::PairingChallenge("qr".into()));

        assert_eq!(m.state(), ConnectionState::AwaitingPairing);
        assert_eq!(m.attempts(), 0);
        assert_eq!(
            effects,
            vec![Effect::Emit(LifecycleEvent::PairingRequired {
                payload: "qr".into()
            })]
        );
    }

    #[test]
    fn test_opened_resets_attempts_and_logs() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        connect_and_close(&mut m, None);
        m.apply(MachineEvent::RetryTimerFired);

        let effects = m.apply(MachineEvent::Opened {
            account: AccountId("me".into()),
        });

        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.attempts(), 0);
        assert!(effects.iter().any(|e| matches!(e, Effect::Log(entry) if entry.event_type == "connected")));
    }

    #[test]
    fn test_transient_close_increments_and_backs_off() {
        let mut m = machine();
        m.apply(MachineEvent::Start);

        for expected in 1..=8u32 {
            let effects = m.apply(closed(Some(408)));
            let (delay, attempt) = scheduled(&effects).unwrap();
            let base = Duration::from_secs(5 * u64::from(expected)).min(Duration::from_secs(30));

            assert_eq!(attempt, expected);
            assert!(delay >= base && delay <= base + Duration::from_millis(1000));
            m.apply(MachineEvent::RetryTimerFired);
        }
    }

    #[test]
    fn test_disconnect_log_records_attempts_before_increment() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        connect_and_close(&mut m, Some(428));
        m.apply(MachineEvent::RetryTimerFired);

        let effects = m.apply(closed(Some(428)));

        let entry = effects
            .iter()
            .find_map(|e| match e {
                Effect::Log(entry) => Some(entry.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(entry.attempt_number, 1);
        assert_eq!(entry.status_code, Some(428));
    }

    #[test]
    fn test_rejected_goes_fatal_after_five_retries() {
        let mut m = machine();
        m.apply(MachineEvent::Start);

        for _ in 0..5 {
            let effects = m.apply(closed(Some(401)));
            assert!(scheduled(&effects).is_some());
            m.apply(MachineEvent::RetryTimerFired);
        }
        let effects = m.apply(closed(Some(500)));

        assert_eq!(m.state(), ConnectionState::Fatal);
        assert!(scheduled(&effects).is_none());
        assert!(m.fatal_reason().is_some());
        assert!(m.apply(MachineEvent::RetryTimerFired).is_empty());
        assert!(m.apply(MachineEvent::Start).is_empty());
    }

    #[test]
    fn test_restart_required_uses_fixed_delay_and_resets_attempts() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        connect_and_close(&mut m, Some(428));
        m.apply(MachineEvent::RetryTimerFired);

        let effects = m.apply(closed(Some(515)));

        assert_eq!(scheduled(&effects), Some((Duration::from_secs(1), 0)));
        assert_eq!(m.attempts(), 0);
        let before = m.generation();
        m.apply(MachineEvent::RetryTimerFired);
        assert_eq!(m.generation(), before.next());
    }

    #[test]
    fn test_integrity_startup_failure_bounded_at_ten() {
        let mut m = machine();
        m.apply(MachineEvent::Start);

        for _ in 0..10 {
            let effects = m.apply(MachineEvent::StartupFailed {
                message: "failed to decrypt".into(),
            });
            assert!(scheduled(&effects).is_some());
            m.apply(MachineEvent::RetryTimerFired);
        }
        m.apply(MachineEvent::StartupFailed {
            message: "failed to decrypt".into(),
        });

        assert_eq!(m.state(), ConnectionState::Fatal);
    }

    #[test]
    fn test_other_startup_failure_is_unbounded() {
        let mut m = machine();
        m.apply(MachineEvent::Start);

        for _ in 0..20 {
            let effects = m.apply(MachineEvent::StartupFailed {
                message: "connection refused".into(),
            });
            assert!(scheduled(&effects).is_some());
            m.apply(MachineEvent::RetryTimerFired);
        }
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_reset_clears_fatal_and_schedules_restart() {
        let mut m = machine();
        m.apply(MachineEvent::Start);
        for _ in 0..6 {
            connect_and_close(&mut m, Some(401));
        }
        assert_eq!(m.state(), ConnectionState::Fatal);

        let effects = m.apply(MachineEvent::Reset);

        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.attempts(), 0);
        assert!(m.fatal_reason().is_none());
        assert!(effects.contains(&Effect::ClearCredentials));
        assert_eq!(scheduled(&effects), Some((Duration::from_secs(3), 0)));
    }

    #[test]
    fn test_close_while_disconnected_is_ignored() {
        let mut m = machine();
        assert!(m.apply(closed(Some(428))).is_empty());
    }
}
