//! Retry, rate limiting and circuit breaking for external providers.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `failure_threshold` consecutive failures. While open every
/// call is refused until `cooldown` has elapsed, after which a single probe
/// is let through (half-open). A successful probe closes the circuit; a
/// failed one re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may be attempted now.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!(provider = %self.name, "Circuit half-open; allowing probe");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let reopen = inner.state == BreakerState::HalfOpen;
        if reopen || inner.consecutive_failures >= self.failure_threshold {
            if !matches!(inner.state, BreakerState::Open { .. }) {
                warn!(
                    provider = %self.name,
                    failures = inner.consecutive_failures,
                    "Circuit opened"
                );
            }
            inner.state = BreakerState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Whether the circuit is currently refusing calls.
    pub fn is_open(&self) -> bool {
        matches!(self.lock().state, BreakerState::Open { .. })
    }
}

/// Build a per-provider limiter allowing `requests_per_second` with an
/// equal burst. Returns `None` (unlimited) for zero.
pub fn rate_limiter(requests_per_second: u32) -> Option<DefaultDirectRateLimiter> {
    NonZeroU32::new(requests_per_second).map(|rps| RateLimiter::direct(Quota::per_second(rps)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::none().backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("mock", 2, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::new("mock", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_probe() {
        let breaker = CircuitBreaker::new("mock", 1, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.is_open());

        // Cooldown elapsed: one probe, then refuse until it resolves
        assert!(breaker.allow());
        assert!(!breaker.allow());
        breaker.record_failure();
        assert!(breaker.is_open());

        assert!(breaker.allow());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.allow());
    }

    #[test]
    fn test_rate_limiter_zero_is_unlimited() {
        assert!(rate_limiter(0).is_none());
        let limiter = rate_limiter(5).unwrap();
        assert!(limiter.check().is_ok());
    }
}
