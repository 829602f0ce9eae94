//! Periodic presence announcements.
//!
//! While a session is connected the keeper sends `available` right away
//! and then once per interval. Any transition out of `Connected` stops the
//! ticker; the next `Connected` starts a fresh one.

use std::time::Duration;

use linkrelay_transport::{Presence, Session};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::{LifecycleEvent, SupervisorHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Time between announcements.
    pub interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    /// A zero interval falls back to the default.
    pub fn validated(mut self) -> Self {
        if self.interval.is_zero() {
            warn!("presence interval is zero, using default");
            self.interval = Self::default().interval;
        }
        self
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background task announcing presence for the connected session.
pub struct PresenceKeeper {
    task: JoinHandle<()>,
}

impl PresenceKeeper {
    /// Spawns the keeper. It runs until the supervisor stops or
    /// [`stop`](Self::stop) is called.
    pub fn spawn<S: Session>(handle: SupervisorHandle<S>, config: PresenceConfig) -> Self {
        Self {
            task: tokio::spawn(run(handle, config.validated())),
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run<S: Session>(handle: SupervisorHandle<S>, config: PresenceConfig) {
    // Subscribe before checking the session so no transition slips between.
    let mut events = handle.subscribe();
    let mut active = handle.session().map(|_| ticker(config.interval));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LifecycleEvent::Connected { .. }) => {
                    active = Some(ticker(config.interval));
                }
                Ok(
                    LifecycleEvent::Disconnected { .. }
                    | LifecycleEvent::Fatal { .. }
                    | LifecycleEvent::Reset,
                ) => active = None,
                Ok(LifecycleEvent::PairingRequired { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "presence keeper lagged, resyncing");
                    active = handle.session().map(|_| ticker(config.interval));
                }
                Err(RecvError::Closed) => break,
            },
            () = next_tick(&mut active) => {
                let Some(current) = handle.session() else {
                    continue;
                };
                match current.session.send_presence(Presence::Available).await {
                    Ok(()) => debug!(generation = %current.generation, "presence sent"),
                    Err(e) => warn!(error = %e, "failed to send presence"),
                }
            }
            () = handle.closed() => break,
        }
    }
    debug!("presence keeper stopped");
}
