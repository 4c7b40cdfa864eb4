//! Token-bucket rate limiter and retry classifier (C3, §4.3).
//!
//! Generalizes the teacher's ad hoc retry loop
//! (`gmail/client.rs::get_message_with_token_retry`, fixed at 3
//! attempts with no token bucket) into a standalone module: a real
//! `governor` token bucket gates every remote call, and a vocabulary
//! classifier decides what's worth retrying.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter as GovernorLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

type Limiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A `qps`-tokens-per-second bucket with burst `qps`, per §4.3.
pub struct RateLimiter {
    inner: Limiter,
}

impl RateLimiter {
    pub fn new(qps: f64) -> Self {
        let qps_rounded = qps.max(1.0).round() as u32;
        let quota = Quota::per_second(NonZeroU32::new(qps_rounded).unwrap());
        Self {
            inner: GovernorLimiter::direct(quota),
        }
    }

    /// Block the calling thread until a token is available, or the
    /// token is cancelled. Cooperative cancellation (§5): checked
    /// between each poll rather than blocking indefinitely.
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<(), super::error::MsgVaultError> {
        loop {
            match self.inner.check() {
                Ok(()) => return Ok(()),
                Err(_not_until) => {
                    if cancel.is_cancelled() {
                        return Err(super::error::MsgVaultError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }
}

/// Classification of a remote-call failure, used to decide whether to
/// retry and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeout, 5xx, 429, quota-exceeded vocabulary match.
    Retryable,
    /// 4xx other than 429, auth errors.
    Terminal,
    /// Cancellation is never retried.
    Cancelled,
}

/// Classify an error message/status using the vocabulary named in §4.3.
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("cancel") {
        return ErrorClass::Cancelled;
    }
    match status {
        Some(429) => ErrorClass::Retryable,
        Some(s) if (500..600).contains(&s) => ErrorClass::Retryable,
        Some(s) if (400..500).contains(&s) => ErrorClass::Terminal,
        _ => {
            if lower.contains("timeout")
                || lower.contains("timed out")
                || lower.contains("quota exceeded")
                || lower.contains("connection reset")
                || lower.contains("rate limit")
            {
                ErrorClass::Retryable
            } else if lower.contains("unauthorized") || lower.contains("auth") {
                ErrorClass::Terminal
            } else {
                // Unknown failures default to retryable: a transient
                // network error is far more common than a new
                // permanent failure mode we haven't named yet.
                ErrorClass::Retryable
            }
        }
    }
}

/// Exponential backoff with jitter: `base * 2^attempt + jitter`,
/// capped at `max_delay`.
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after_hint {
            return hint.min(self.max_delay);
        }
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter = Duration::from_millis(jitter_ms());
        (exp + jitter).min(self.max_delay)
    }

    /// Run `f` under this retry policy. `f` returns `Err((class, err,
    /// retry_after))`; retryable errors sleep and loop, terminal errors
    /// and cancellation return immediately. The original typed `err` is
    /// returned as-is on the terminal path, so callers can still match
    /// on e.g. `MsgVaultError::InsufficientScope` (§4.7) instead of it
    /// being collapsed into a generic `Remote(String)`.
    pub fn run<T>(
        &self,
        cancel: &CancellationToken,
        mut f: impl FnMut() -> Result<T, (ErrorClass, super::error::MsgVaultError, Option<Duration>)>,
    ) -> Result<T, super::error::MsgVaultError> {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err((ErrorClass::Cancelled, _, _)) => {
                    return Err(super::error::MsgVaultError::Cancelled);
                }
                Err((ErrorClass::Terminal, err, _)) => {
                    return Err(err);
                }
                Err((ErrorClass::Retryable, err, retry_after)) => {
                    if attempt + 1 >= self.max_attempts {
                        warn!("msgvault::ratelimit: giving up after {} attempts: {}", attempt + 1, err);
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt, retry_after);
                    debug!("msgvault::ratelimit: retrying after {:?} (attempt {}): {}", delay, attempt + 1, err);
                    if cancel.is_cancelled() {
                        return Err(super::error::MsgVaultError::Cancelled);
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Shared rate limiter + retry policy handed to every remote client.
pub struct Throttle {
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
}

impl Throttle {
    pub fn new(qps: f64) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(qps)),
            retry: RetryPolicy::default(),
        }
    }
}

fn jitter_ms() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() % 250
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_429_is_retryable() {
        assert_eq!(classify(Some(429), ""), ErrorClass::Retryable);
    }

    #[test]
    fn classify_5xx_is_retryable() {
        assert_eq!(classify(Some(503), ""), ErrorClass::Retryable);
    }

    #[test]
    fn classify_4xx_other_than_429_is_terminal() {
        assert_eq!(classify(Some(404), ""), ErrorClass::Terminal);
    }

    #[test]
    fn classify_cancellation_vocabulary() {
        assert_eq!(classify(None, "operation cancelled"), ErrorClass::Cancelled);
    }

    #[test]
    fn retry_policy_honors_retry_after_hint() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_attempt(0, Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn retry_policy_caps_at_max_delay() {
        let policy = RetryPolicy {
            base: Duration::from_secs(10),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        };
        let delay = policy.delay_for_attempt(10, None);
        assert!(delay <= Duration::from_secs(5));
    }

    #[test]
    fn retry_run_returns_terminal_error_without_retrying() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), _> = policy.run(&cancel, || {
            calls += 1;
            Err((ErrorClass::Terminal, crate::error::MsgVaultError::Remote("nope".into()), None))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_run_preserves_terminal_error_identity() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let result: Result<(), _> = policy.run(&cancel, || {
            Err((ErrorClass::Terminal, crate::error::MsgVaultError::InsufficientScope, None))
        });
        assert!(matches!(result, Err(crate::error::MsgVaultError::InsufficientScope)));
    }

    #[test]
    fn retry_run_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::default();
        let result: Result<(), _> = policy.run(&cancel, || {
            Err((
                ErrorClass::Retryable,
                crate::error::MsgVaultError::Remote("slow down".into()),
                None,
            ))
        });
        assert!(matches!(result, Err(crate::error::MsgVaultError::Cancelled)));
    }
}
