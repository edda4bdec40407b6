//! Embedding service.
//!
//! Wraps one [`EmbeddingProvider`] (plus an optional fallback) with the
//! machinery every external call needs: a shared content-hash cache,
//! batching, a semaphore bounding in-flight batches, a per-provider rate
//! limiter, bounded retries and a circuit breaker.
//!
//! Vectors produced by different providers are never mixed. When the
//! primary's circuit opens and a fallback is configured, the service
//! switches to the fallback for the rest of its lifetime and re-embeds every
//! item of the call that tripped the breaker.

use super::cache::{CacheLookup, EmbeddingCache};
use super::resilience::{rate_limiter, CircuitBreaker, RetryPolicy};
use super::{content_hash, normalize_text, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::models::Embedding;
use governor::DefaultDirectRateLimiter;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime knobs for the embedding service.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSettings {
    /// Texts per provider call
    pub batch_size: usize,

    /// Batches in flight at once
    pub max_concurrency: usize,

    pub retry: RetryPolicy,

    /// Provider calls per second; zero disables limiting
    pub requests_per_second: u32,

    /// Consecutive failed calls before the circuit opens
    pub breaker_threshold: u32,

    pub breaker_cooldown: Duration,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            requests_per_second: 0,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// A text to embed, addressed by a caller-chosen key (source or code id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedItem {
    pub key: String,
    pub text: String,
}

impl EmbedItem {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

/// Outcome of one [`EmbeddingService::embed_items`] call.
#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    /// Embeddings by item key
    pub embeddings: HashMap<String, Embedding>,

    /// Keys that could not be embedded, sorted
    pub failed: Vec<String>,

    pub cache_hits: usize,

    /// Cached vectors discarded because their dimension was wrong
    pub stale: usize,

    /// `provider/model` that produced every vector in this outcome
    pub provider: String,

    /// Whether this call switched to the fallback provider
    pub failed_over: bool,
}

impl EmbedOutcome {
    /// Fraction of requested items that could not be embedded.
    pub fn failure_ratio(&self) -> f32 {
        let total = self.embeddings.len() + self.failed.len();
        if total == 0 {
            0.0
        } else {
            self.failed.len() as f32 / total as f32
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn EmbeddingProvider>,
    breaker: CircuitBreaker,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl ProviderSlot {
    fn new(provider: Arc<dyn EmbeddingProvider>, settings: &EmbeddingSettings) -> Self {
        let label = describe(provider.as_ref());
        Self {
            breaker: CircuitBreaker::new(
                label,
                settings.breaker_threshold,
                settings.breaker_cooldown,
            ),
            limiter: rate_limiter(settings.requests_per_second),
            provider,
        }
    }
}

fn describe(provider: &dyn EmbeddingProvider) -> String {
    format!("{}/{}", provider.provider_name(), provider.model_name())
}

/// Texts that share a content hash are embedded once.
struct PendingText {
    hash: String,
    text: String,
    keys: Vec<String>,
}

struct Attempt {
    outcome: EmbedOutcome,
    circuit_opened: bool,
}

/// Cached, batched, rate-limited access to an embedding provider.
pub struct EmbeddingService {
    primary: Arc<ProviderSlot>,
    fallback: Option<Arc<ProviderSlot>>,
    using_fallback: AtomicBool,
    cache: Arc<EmbeddingCache>,
    semaphore: Arc<Semaphore>,
    settings: EmbeddingSettings,
}

impl EmbeddingService {
    /// Create a service around a single provider.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        settings: EmbeddingSettings,
    ) -> Self {
        let settings = EmbeddingSettings {
            batch_size: settings.batch_size.max(1),
            max_concurrency: settings.max_concurrency.max(1),
            ..settings
        };
        Self {
            primary: Arc::new(ProviderSlot::new(provider, &settings)),
            fallback: None,
            using_fallback: AtomicBool::new(false),
            cache,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency)),
            settings,
        }
    }

    /// Attach a provider to switch to when the primary's circuit opens.
    pub fn with_fallback(mut self, fallback: Arc<dyn EmbeddingProvider>) -> Self {
        self.fallback = Some(Arc::new(ProviderSlot::new(fallback, &self.settings)));
        self
    }

    fn active(&self) -> &Arc<ProviderSlot> {
        match (&self.fallback, self.using_fallback.load(Ordering::Acquire)) {
            (Some(fallback), true) => fallback,
            _ => &self.primary,
        }
    }

    /// Dimension of the provider currently in use.
    pub fn dimension(&self) -> usize {
        self.active().provider.dimension()
    }

    /// `provider/model` of the provider currently in use.
    pub fn provider_label(&self) -> String {
        describe(self.active().provider.as_ref())
    }

    /// Whether the service has failed over to its fallback provider.
    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Acquire)
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Embed a set of items.
    ///
    /// Items that fail after retries are reported in
    /// [`EmbedOutcome::failed`] instead of failing the call.
    ///
    /// # Arguments
    /// * `items` - Texts to embed, keyed by caller id
    /// * `ceiling` - Maximum tolerated fraction of unembedded items
    /// * `cancel` - Checked before every batch is dispatched
    ///
    /// # Errors
    /// - `EmbeddingError::Cancelled` if the token fired; in-flight batches
    ///   are awaited first
    /// - `EmbeddingError::CeilingExceeded` if too many items failed
    pub async fn embed_items(
        &self,
        items: Vec<EmbedItem>,
        ceiling: f32,
        cancel: &CancellationToken,
    ) -> EmbeddingResult<EmbedOutcome> {
        if items.is_empty() {
            return Ok(EmbedOutcome {
                provider: self.provider_label(),
                ..Default::default()
            });
        }

        let mut failed_over = false;
        let attempt = loop {
            let slot = Arc::clone(self.active());
            let attempt = self.embed_with(&slot, &items, cancel).await?;

            let can_fail_over = attempt.circuit_opened
                && self.fallback.is_some()
                && !self.using_fallback.load(Ordering::Acquire);
            if !can_fail_over {
                break attempt;
            }
            warn!(
                primary = %describe(slot.provider.as_ref()),
                items = items.len(),
                "Primary embedding provider isolated; switching to fallback and re-embedding"
            );
            self.using_fallback.store(true, Ordering::Release);
            failed_over = true;
        };

        let mut outcome = attempt.outcome;
        outcome.failed_over = failed_over;

        let ratio = outcome.failure_ratio();
        if ratio > ceiling {
            error!(
                failed = outcome.failed.len(),
                total = items.len(),
                ceiling,
                "Too many items could not be embedded"
            );
            return Err(EmbeddingError::CeilingExceeded {
                failed: outcome.failed.len(),
                total: items.len(),
                ceiling,
            });
        }
        if !outcome.failed.is_empty() {
            warn!(
                failed = outcome.failed.len(),
                total = items.len(),
                "Some items were not embedded and will be excluded"
            );
        }
        Ok(outcome)
    }

    async fn embed_with(
        &self,
        slot: &Arc<ProviderSlot>,
        items: &[EmbedItem],
        cancel: &CancellationToken,
    ) -> EmbeddingResult<Attempt> {
        let provider = slot.provider.as_ref();
        let dimension = provider.dimension();
        let mut outcome = EmbedOutcome {
            provider: describe(provider),
            ..Default::default()
        };

        let mut pending: BTreeMap<String, PendingText> = BTreeMap::new();
        for item in items {
            let text = normalize_text(&item.text);
            if text.is_empty() {
                debug!(key = %item.key, "Skipping empty text");
                continue;
            }
            let hash = content_hash(provider.provider_name(), provider.model_name(), &text);
            match self.cache.get(&hash, dimension) {
                CacheLookup::Hit(vector) => {
                    outcome.cache_hits += 1;
                    outcome
                        .embeddings
                        .insert(item.key.clone(), Embedding::new(vector));
                    continue;
                }
                CacheLookup::Stale { .. } => outcome.stale += 1,
                CacheLookup::Miss => {}
            }
            pending
                .entry(hash.clone())
                .or_insert_with(|| PendingText {
                    hash,
                    text,
                    keys: Vec::new(),
                })
                .keys
                .push(item.key.clone());
        }

        let pending: Vec<PendingText> = pending.into_values().collect();
        let mut circuit_opened = false;
        let mut cancelled = false;
        let mut tasks = JoinSet::new();
        let retry = self.settings.retry;

        for batch in pending.chunks(self.settings.batch_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                    .map_err(|e| EmbeddingError::Other(format!("embedding pool closed: {}", e)))?,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            };
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let hashes: Vec<String> = batch.iter().map(|p| p.hash.clone()).collect();
            let keys: Vec<Vec<String>> = batch.iter().map(|p| p.keys.clone()).collect();
            let slot = Arc::clone(slot);
            tasks.spawn(async move {
                let _permit = permit;
                let result = run_batch(&slot, &texts, retry).await;
                (hashes, keys, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (hashes, keys, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Embedding task failed to complete");
                    continue;
                }
            };
            match result {
                Ok(vectors) => {
                    for ((hash, keys), vector) in hashes.into_iter().zip(keys).zip(vectors) {
                        self.cache.insert(hash, vector.clone());
                        let embedding = Embedding::new(vector);
                        for key in keys {
                            outcome.embeddings.insert(key, embedding.clone());
                        }
                    }
                }
                Err(e) => {
                    if matches!(e, EmbeddingError::CircuitOpen(_)) {
                        circuit_opened = true;
                    }
                    warn!(
                        provider = %outcome.provider,
                        error = %e,
                        texts = hashes.len(),
                        "Embedding batch failed"
                    );
                }
            }
        }

        if cancelled {
            info!("Embedding cancelled; in-flight batches drained");
            return Err(EmbeddingError::Cancelled);
        }

        let mut failed: Vec<String> = items
            .iter()
            .filter(|item| !outcome.embeddings.contains_key(&item.key))
            .map(|item| item.key.clone())
            .collect();
        failed.sort();
        failed.dedup();
        outcome.failed = failed;
        circuit_opened |= slot.breaker.is_open();

        Ok(Attempt {
            outcome,
            circuit_opened,
        })
    }
}

/// One batch against one provider, with retries.
async fn run_batch(
    slot: &ProviderSlot,
    texts: &[String],
    retry: RetryPolicy,
) -> EmbeddingResult<Vec<Vec<f32>>> {
    let provider = slot.provider.as_ref();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let mut attempt = 0u32;
    loop {
        if !slot.breaker.allow() {
            return Err(EmbeddingError::CircuitOpen(describe(provider)));
        }
        if let Some(limiter) = &slot.limiter {
            limiter.until_ready().await;
        }

        let result = provider
            .embed_batch(&refs)
            .await
            .and_then(|vectors| check_vectors(vectors, texts.len(), provider.dimension()));
        match result {
            Ok(vectors) => {
                slot.breaker.record_success();
                return Ok(vectors);
            }
            Err(e) => {
                slot.breaker.record_failure();
                if e.is_retryable() && attempt < retry.max_retries {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    debug!(error = %e, attempt, ?delay, "Retrying embedding batch");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

/// Reject responses with the wrong shape before they reach the cache.
fn check_vectors(
    vectors: Vec<Vec<f32>>,
    expected_count: usize,
    dimension: usize,
) -> EmbeddingResult<Vec<Vec<f32>>> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::ApiError(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            expected_count
        )));
    }
    for vector in &vectors {
        if vector.len() != dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidVector(
                "vector contains NaN or infinite values".to_string(),
            ));
        }
    }
    Ok(vectors)
}
