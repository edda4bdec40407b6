//! Storage layer abstraction and implementations.
//!
//! This module defines the interface for persisting extraction results. The
//! abstraction allows for different storage backends while maintaining a
//! consistent API; results are write-once, so stores only insert and read.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ResearchPurpose;
use crate::models::ExtractionResult;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution failed: {0}")]
    QueryError(String),

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A result with the same run id already exists
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Other unexpected errors
    #[error("Unexpected storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// One row of [`ResultStore::list_runs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub purpose: ResearchPurpose,
    pub theme_count: usize,
    pub quality_score: f32,
    pub saturation_reached: bool,
    pub complete: bool,
    pub finished_at: DateTime<Utc>,
}

impl From<&ExtractionResult> for RunSummary {
    fn from(result: &ExtractionResult) -> Self {
        Self {
            run_id: result.run_id.clone(),
            purpose: result.purpose,
            theme_count: result.theme_count(),
            quality_score: result.quality_score,
            saturation_reached: result.saturation_reached,
            complete: result.status.is_complete(),
            finished_at: result.finished_at,
        }
    }
}

/// Trait for result storage backends.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a finished result.
    ///
    /// # Returns
    /// The run id under which the result was stored
    ///
    /// # Errors
    /// Returns `StorageError::DuplicateEntry` if the run id is already
    /// stored, or other `StorageError` variants for other failures
    async fn save(&self, result: &ExtractionResult) -> StorageResult<String>;

    /// Load a stored result.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if no result has this run id
    async fn load(&self, run_id: &str) -> StorageResult<ExtractionResult>;

    /// Summaries of all stored runs, newest first.
    async fn list_runs(&self) -> StorageResult<Vec<RunSummary>>;
}
