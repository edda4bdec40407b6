//! Content provider module.
//!
//! This module defines the interface for fetching source documents and
//! includes a JSON file implementation.
//!
//! The `ContentProvider` trait abstracts where sources come from, so the
//! extraction pipeline can work with local files, literature databases or
//! search services without coupling to any of them.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::SourceContent;

pub mod json;

/// Errors that can occur when fetching sources from a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Failed to read from the data source
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the data format
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Requested sources do not exist
    #[error("Unknown source ids: {0:?}")]
    NotFound(Vec<String>),

    /// Network or connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Other provider-specific errors
    #[error("Provider error: {0}")]
    Other(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Trait for fetching source content.
///
/// # Design Notes
///
/// - Sources are returned as fetched; validation and deduplication happen in
///   the pipeline's familiarization stage
/// - Providers are responsible for their own pagination and rate limiting
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Fetch the given sources.
    ///
    /// # Arguments
    /// * `source_ids` - Identifiers of the sources to fetch
    ///
    /// # Returns
    /// The sources in the order of `source_ids`
    ///
    /// # Errors
    /// Returns `ProviderError::NotFound` if any id is unknown, or another
    /// `ProviderError` if sources cannot be read
    async fn fetch(&self, source_ids: &[String]) -> ProviderResult<Vec<SourceContent>>;

    /// Fetch every source the provider offers.
    async fn fetch_all(&self) -> ProviderResult<Vec<SourceContent>>;

    /// Get a human-readable name/description of this provider.
    fn name(&self) -> &str;
}
