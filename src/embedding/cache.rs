//! Shared embedding cache keyed by content hash.
//!
//! The cache is read-mostly and safe to share across concurrent batches.
//! Embeddings are deterministic for identical input, so concurrent writes
//! for the same key are idempotent upserts and the last write wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A vector of the expected dimension was found
    Hit(Vec<f32>),

    /// Nothing is cached under this key
    Miss,

    /// A vector was cached with a different dimension and has been evicted
    Stale {
        /// Dimension of the evicted vector
        cached_dimension: usize,
    },
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub entries: usize,
}

/// In-memory content-hash → vector cache.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

impl EmbeddingCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written vector
    // behind, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<f32>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<f32>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a vector, treating a dimension mismatch as stale.
    ///
    /// A stale entry is never truncated or padded. It is logged, evicted and
    /// reported so the caller re-embeds the text with the active provider.
    ///
    /// # Arguments
    /// * `key` - Content hash from [`content_hash`](super::content_hash)
    /// * `expected_dimension` - Dimension of the active provider
    pub fn get(&self, key: &str, expected_dimension: usize) -> CacheLookup {
        let cached_dimension = match self.read().get(key) {
            Some(vector) if vector.len() == expected_dimension => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(vector.clone());
            }
            Some(vector) => vector.len(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Miss;
            }
        };

        warn!(
            key = %key,
            cached_dimension,
            expected_dimension,
            "Cached embedding has the wrong dimension; evicting and re-embedding"
        );
        self.write().remove(key);
        self.stale.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Stale { cached_dimension }
    }

    /// Insert or replace a vector.
    pub fn insert(&self, key: String, vector: Vec<f32>) {
        self.write().insert(key, vector);
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the hit/miss/stale counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
