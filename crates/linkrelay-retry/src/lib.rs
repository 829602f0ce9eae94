//! Bounded retry with backoff for linkrelay.
//!
//! Every retry site in the workspace (credential writes, webhook
//! deliveries, session reconnects) computes its delays through a
//! [`RetryPolicy`], so the backoff arithmetic lives in exactly one place.
//!
//! Two ways to use it:
//!
//! - [`retry`] / [`retry_counted`] drive an async operation to completion,
//!   sleeping between failed attempts.
//! - [`RetryPolicy::delay_for`] and [`RetryPolicy::allows`] give the raw
//!   schedule to callers that own their own timer (the connection
//!   supervisor keeps a single cancellable retry timer inside its actor
//!   loop).
//!
//! ```ignore
//! let policy = RetryPolicy::linear(Duration::from_secs(1), None).with_max_attempts(3);
//! let value = retry("store.write", &policy, |attempt| async move {
//!     write_once(attempt).await
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// How the base delay grows with the attempt number.
///
/// `attempt` is 1-based: the delay after the first failure is
/// `delay(1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// `step * attempt`, optionally capped.
    Linear { step: Duration, cap: Option<Duration> },
    /// Explicit delays; attempts past the end reuse the last entry.
    Schedule(Vec<Duration>),
    /// Same delay every time.
    Fixed(Duration),
}

impl Backoff {
    /// Base delay (no jitter) after failure number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Linear { step, cap } => {
                let raw = step.saturating_mul(attempt);
                match cap {
                    Some(cap) => raw.min(*cap),
                    None => raw,
                }
            }
            Self::Schedule(delays) => {
                let idx = attempt.saturating_sub(1) as usize;
                delays
                    .get(idx)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
            Self::Fixed(d) => *d,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Attempt limit + backoff + jitter bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum total attempts. `None` = unbounded.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Uniform random `0..=jitter` added to every delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn linear(step: Duration, cap: Option<Duration>) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Linear { step, cap },
            jitter: Duration::ZERO,
        }
    }

    pub fn schedule(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Schedule(delays.into()),
            jitter: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(delay),
            jitter: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fix values that would make the policy misbehave.
    ///
    /// - `max_attempts` of 0 is raised to 1 (the operation always runs once).
    pub fn validated(mut self) -> Self {
        if self.max_attempts == Some(0) {
            warn!("retry max_attempts of 0 raised to 1");
            self.max_attempts = Some(1);
        }
        self
    }

    /// Whether attempt number `attempt` (1-based) is within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Base delay without jitter after failure number `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Delay after failure number `attempt`: base plus `0..=jitter`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

// ---------------------------------------------------------------------------
// Combinator
// ---------------------------------------------------------------------------

/// The operation failed on every allowed attempt.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The error from the final attempt.
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
        }
    }
}

/// A successful result plus how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Each failure is logged with
/// `label`; the delay before the next attempt comes from
/// [`RetryPolicy::delay_for`].
pub async fn retry<T, E, F, Fut>(label: &str, policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_counted(label, policy, op).await.map(|a| a.value)
}

/// Like [`retry`] but also reports the attempt count on success.
pub async fn retry_counted<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<Attempted<T>, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = label, attempt, "succeeded after retry");
                }
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) => {
                if !policy.allows(attempt + 1) {
                    warn!(op = label, attempt, error = %e, "attempts exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    op = label,
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(non_snake_case)]
    fn S(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn test_linear_delay_grows_and_caps() {
        let b = Backoff::Linear {
            step: S(5),
            cap: Some(S(30)),
        };
        assert_eq!(b.delay(1), S(5));
        assert_eq!(b.delay(3), S(15));
        assert_eq!(b.delay(6), S(30));
        assert_eq!(b.delay(50), S(30));
    }

    #[test]
    fn test_schedule_delay_reuses_last_entry() {
        let b = Backoff::Schedule(vec![S(2), S(5), S(10)]);
        assert_eq!(b.delay(1), S(2));
        assert_eq!(b.delay(2), S(5));
        assert_eq!(b.delay(3), S(10));
        assert_eq!(b.delay(9), S(10));
    }

    #[test]
    fn test_schedule_empty_is_zero() {
        assert_eq!(Backoff::Schedule(Vec::new()).delay(1), Duration::ZERO);
    }

    #[test]
    fn test_delay_for_stays_within_jitter_bound() {
        let policy = RetryPolicy::linear(S(5), Some(S(30))).with_jitter(Duration::from_millis(1000));
        for attempt in 1..20 {
            let base = policy.base_delay(attempt);
            let d = policy.delay_for(attempt);
            assert!(d >= base);
            assert!(d <= base + Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_allows_respects_limit() {
        let policy = RetryPolicy::fixed(S(1)).with_max_attempts(3);
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(RetryPolicy::fixed(S(1)).allows(u32::MAX));
    }

    #[test]
    fn test_validated_raises_zero_attempts() {
        let policy = RetryPolicy::fixed(S(1)).with_max_attempts(0).validated();
        assert_eq!(policy.max_attempts, Some(1));
    }
}
