//! Embedding provider abstraction and implementations.
//!
//! This module defines the interface for text embedding generation and provides
//! two interchangeable implementations: a local model ([`fastembed`]) and a
//! remote API ([`openai`]). A run picks one of them at construction time and
//! uses it for every call; the [`service`] layer adds caching, batching,
//! bounded concurrency, rate limiting, retries and a circuit breaker on top.

pub mod cache;
pub mod fastembed;
pub mod openai;
pub mod resilience;
pub mod service;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    /// Network or API communication error
    #[error("API request failed: {0}")]
    ApiError(String),

    /// The provider asked us to slow down
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// Invalid input text (e.g., empty, too long)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., missing API key)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A vector does not have the dimension the provider advertises
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A vector contains NaN or infinite values
    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    /// The provider is isolated by its circuit breaker
    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    /// Too many items could not be embedded
    #[error("{failed} of {total} items could not be embedded (ceiling {ceiling:.2})")]
    CeilingExceeded {
        failed: usize,
        total: usize,
        ceiling: f32,
    },

    /// The run was cancelled before all batches were dispatched
    #[error("Embedding cancelled")]
    Cancelled,

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::ApiError(_) | EmbeddingError::RateLimited(_))
    }
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Trait for text embedding providers.
///
/// Implementors of this trait can generate vector embeddings from text inputs.
/// The trait is async to support API-based embedding services.
///
/// # Example Usage
/// ```ignore
/// let provider = FastEmbedProvider::new(None, None)?;
/// let text = normalize_text("Teacher burnout in rural schools");
/// let embedding = provider.embed(&text).await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Arguments
    /// * `text` - The input text to embed (should be pre-normalized)
    ///
    /// # Errors
    /// Returns `EmbeddingError` if the embedding generation fails
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Generate embeddings for multiple texts in a single batch.
    ///
    /// # Returns
    /// A vector of embedding vectors, in the same order as the input texts
    ///
    /// # Errors
    /// Returns `EmbeddingError` if any embedding generation fails
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Get the dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    /// Get the model name/identifier for this provider.
    fn model_name(&self) -> &str;

    /// Short name of the provider family (e.g., "fastembed", "openai").
    fn provider_name(&self) -> &str;
}

/// Normalizes text for consistent embedding generation.
///
/// This function applies the following transformations:
/// - Converts to lowercase
/// - Trims leading/trailing whitespace
/// - Collapses multiple consecutive spaces to a single space
///
/// # Example
/// ```ignore
/// let normalized = normalize_text("  Hello   World  ");
/// assert_eq!(normalized, "hello world");
/// ```
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for a text embedded by a given provider and model.
///
/// The key covers the provider and model, not the dimension, so that a
/// cached vector of the wrong size can be detected as stale.
pub fn content_hash(provider_name: &str, model_name: &str, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_text.as_bytes());
    hex::encode(hasher.finalize())
}
