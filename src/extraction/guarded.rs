//! Oracle access with retries, rate limiting and a circuit breaker.
//!
//! Every oracle call made by the pipeline goes through [`GuardedOracle`].
//! Before each attempt the breaker is consulted and the limiter awaited;
//! once the breaker opens, calls fail fast with
//! [`OracleError::CircuitOpen`] instead of reaching the provider.

use super::{CodeExtractionOracle, ExtractionContext, OracleError, OracleResult};
use crate::embedding::resilience::{rate_limiter, CircuitBreaker, RetryPolicy};
use crate::models::SourceContent;
use governor::DefaultDirectRateLimiter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Call policy for the code extraction oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleSettings {
    /// Oracle calls in flight at once
    pub max_concurrency: usize,

    /// Retries for unavailable or rate-limited oracles
    pub retry: RetryPolicy,

    /// Oracle calls per second; zero disables limiting
    pub requests_per_second: u32,

    /// Consecutive failed calls before the circuit opens
    pub breaker_threshold: u32,

    pub breaker_cooldown: Duration,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            requests_per_second: 0,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// An oracle wrapped with its breaker and limiter.
pub struct GuardedOracle {
    oracle: Arc<dyn CodeExtractionOracle>,
    breaker: CircuitBreaker,
    limiter: Option<DefaultDirectRateLimiter>,
    retry: RetryPolicy,
}

impl GuardedOracle {
    pub fn new(oracle: Arc<dyn CodeExtractionOracle>, settings: &OracleSettings) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                oracle.name().to_string(),
                settings.breaker_threshold,
                settings.breaker_cooldown,
            ),
            limiter: rate_limiter(settings.requests_per_second),
            retry: settings.retry,
            oracle,
        }
    }

    pub fn name(&self) -> &str {
        self.oracle.name()
    }

    /// Whether the breaker is refusing calls.
    pub fn is_isolated(&self) -> bool {
        self.breaker.is_open()
    }

    /// Extract codes for one source.
    ///
    /// # Errors
    /// - `OracleError::CircuitOpen` if the breaker refuses the attempt
    /// - The oracle's own error once retries are exhausted, or at once for
    ///   errors that are not retryable
    pub async fn extract(
        &self,
        source: &SourceContent,
        context: &ExtractionContext,
    ) -> OracleResult<Value> {
        let mut attempt = 0u32;
        loop {
            if !self.breaker.allow() {
                return Err(OracleError::CircuitOpen(self.oracle.name().to_string()));
            }
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match self.oracle.extract_codes(source, context).await {
                Ok(raw) => {
                    self.breaker.record_success();
                    return Ok(raw);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if e.is_retryable() && attempt < self.retry.max_retries {
                        attempt += 1;
                        let delay = self.retry.backoff(attempt);
                        debug!(source = %source.id, attempt, ?delay, error = %e, "Retrying code extraction");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}
