//! SQLite storage implementation.
//!
//! This module provides a SQLite-based implementation of the `ResultStore`
//! trait. Each result is stored as one row: summary columns for listing plus
//! the full artifact as a JSON document.

use super::{ResultStore, RunSummary, StorageError, StorageResult};
use crate::models::ExtractionResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::{debug, info};

/// SQLite-based result storage.
///
/// # Schema
/// ```text
/// runs(run_id TEXT PRIMARY KEY, purpose TEXT, theme_count INTEGER,
///      quality_score REAL, saturation_reached INTEGER, complete INTEGER,
///      finished_at TEXT, result_json TEXT)
/// ```
#[derive(Debug, Clone)]
pub struct SqliteResultStore {
    /// Path to the SQLite database file
    db_path: PathBuf,
}

fn query_error(err: rusqlite::Error) -> StorageError {
    StorageError::QueryError(err.to_string())
}

fn open(path: &Path) -> StorageResult<Connection> {
    Connection::open(path).map_err(|e| StorageError::ConnectionError(e.to_string()))
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Other(format!("storage task failed: {}", e)))?
}

impl SqliteResultStore {
    /// Open (or create) a result database.
    ///
    /// # Errors
    /// Returns `StorageError` if the database cannot be opened or the schema
    /// cannot be created
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let schema_path = path.clone();

        blocking(move || {
            let conn = open(&schema_path)?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    purpose TEXT NOT NULL,
                    theme_count INTEGER NOT NULL,
                    quality_score REAL NOT NULL,
                    saturation_reached INTEGER NOT NULL,
                    complete INTEGER NOT NULL,
                    finished_at TEXT NOT NULL,
                    result_json TEXT NOT NULL
                );
                "#,
                [],
            )
            .map_err(query_error)?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_runs_finished_at ON runs(finished_at);",
                [],
            )
            .map_err(query_error)?;
            Ok(())
        })
        .await?;

        info!(path = %path.display(), "Opened result store");
        Ok(Self { db_path: path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, result: &ExtractionResult) -> StorageResult<String> {
        let summary = RunSummary::from(result);
        let json = serde_json::to_string(result)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let path = self.db_path.clone();

        let run_id = blocking(move || {
            let conn = open(&path)?;
            let inserted = conn.execute(
                "INSERT INTO runs (run_id, purpose, theme_count, quality_score, saturation_reached, complete, finished_at, result_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &summary.run_id,
                    summary.purpose.as_str(),
                    summary.theme_count as i64,
                    summary.quality_score as f64,
                    summary.saturation_reached,
                    summary.complete,
                    summary.finished_at.to_rfc3339(),
                    &json
                ],
            );
            match inserted {
                Ok(_) => Ok(summary.run_id),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StorageError::DuplicateEntry(summary.run_id))
                }
                Err(e) => Err(query_error(e)),
            }
        })
        .await?;

        debug!(run_id = %run_id, "Stored extraction result");
        Ok(run_id)
    }

    async fn load(&self, run_id: &str) -> StorageResult<ExtractionResult> {
        let path = self.db_path.clone();
        let id = run_id.to_string();

        let json: Option<String> = blocking(move || {
            let conn = open(&path)?;
            conn.query_row(
                "SELECT result_json FROM runs WHERE run_id = ?1",
                params![&id],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_error)
        })
        .await?;

        let json = json.ok_or_else(|| StorageError::NotFound(run_id.to_string()))?;
        serde_json::from_str(&json).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunSummary>> {
        let path = self.db_path.clone();

        let rows: Vec<(String, String, i64, f64, bool, bool, String)> = blocking(move || {
            let conn = open(&path)?;
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, purpose, theme_count, quality_score, saturation_reached, complete, finished_at \
                     FROM runs ORDER BY finished_at DESC, run_id ASC",
                )
                .map_err(query_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;
            Ok(rows)
        })
        .await?;

        rows.into_iter()
            .map(
                |(run_id, purpose, theme_count, quality_score, saturation_reached, complete, finished_at)| {
                    let purpose = purpose
                        .parse()
                        .map_err(|e| StorageError::SerializationError(format!("{}", e)))?;
                    let finished_at = DateTime::parse_from_rfc3339(&finished_at)
                        .map_err(|e| StorageError::SerializationError(e.to_string()))?
                        .with_timezone(&Utc);
                    Ok(RunSummary {
                        run_id,
                        purpose,
                        theme_count: theme_count.max(0) as usize,
                        quality_score: quality_score as f32,
                        saturation_reached,
                        complete,
                        finished_at,
                    })
                },
            )
            .collect()
    }
}
