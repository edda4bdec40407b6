//! Core data models for the thematic analysis engine.
//!
//! This module contains the fundamental data structures that flow through the
//! extraction pipeline: source documents, embeddings, initial codes, clusters,
//! candidate themes and the final extraction result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResearchPurpose;

/// Kind of text a source carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Paper abstract only
    Abstract,

    /// Full paper text
    FullText,
}

impl Default for ContentKind {
    fn default() -> Self {
        ContentKind::Abstract
    }
}

/// A single source document fed into the pipeline.
///
/// Sources are immutable once fetched and owned by the run for its lifetime.
/// Codes refer back to their source by `id` only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceContent {
    /// Unique identifier of the source (e.g., DOI or database key)
    pub id: String,

    /// Optional title, used for display and provenance only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Source text (abstract or full text)
    pub text: String,

    /// Whether `text` is an abstract or a full text
    #[serde(default)]
    pub content_kind: ContentKind,

    /// Number of whitespace-separated words in `text`
    pub word_count: usize,
}

impl SourceContent {
    /// Create a new source, computing its word count.
    ///
    /// # Arguments
    /// * `id` - Unique identifier of the source
    /// * `text` - The abstract or full text
    /// * `content_kind` - Kind of text provided
    pub fn new(id: impl Into<String>, text: impl Into<String>, content_kind: ContentKind) -> Self {
        let text = text.into();
        let word_count = text.split_whitespace().count();
        Self {
            id: id.into(),
            title: None,
            text,
            content_kind,
            word_count,
        }
    }

    /// Attach a title to the source.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A fixed-dimension embedding vector with its precomputed L2 norm.
///
/// The norm is computed once at construction so that pairwise similarity
/// computations over large clusters do not recompute it for every pair.
/// Fields are private to keep `norm` in sync with `vector`; serialized as a
/// plain array and re-normed on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    vector: Vec<f32>,
    norm: f32,
}

impl Embedding {
    /// Wrap a raw vector, computing its norm.
    pub fn new(vector: Vec<f32>) -> Self {
        let norm = crate::similarity::magnitude(&vector);
        Self { vector, norm }
    }

    /// The raw embedding values.
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    /// The precomputed L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.norm
    }

    /// Number of dimensions of this embedding.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Whether every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.norm.is_finite() && self.vector.iter().all(|v| v.is_finite())
    }

    /// Consume the embedding, returning the raw vector.
    pub fn into_vector(self) -> Vec<f32> {
        self.vector
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(vector: Vec<f32>) -> Self {
        Embedding::new(vector)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.vector
    }
}

/// A short labeled concept extracted from a source document.
///
/// Codes are the atomic unit that gets clustered into themes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitialCode {
    /// Unique code identifier (stable across runs for the same input)
    pub id: String,

    /// Short label (a few words)
    pub label: String,

    /// One or two sentence description
    pub description: String,

    /// Back-reference to the source this code came from
    pub source_id: String,

    /// Embedding of `label + description`, once generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

impl InitialCode {
    /// Create a code without an embedding.
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: description.into(),
            source_id: source_id.into(),
            embedding: None,
        }
    }

    /// Attach an embedding to the code.
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Text used to embed this code.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.label, self.description)
    }
}

/// Transient grouping of codes produced by the clustering engine.
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Member codes, ordered by id
    pub codes: Vec<InitialCode>,

    /// Mean embedding of the member codes
    pub centroid: Vec<f32>,
}

impl Cluster {
    /// Number of codes in the cluster.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the cluster has no members.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Contribution of one source to a theme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceContribution {
    /// Source identifier
    pub source_id: String,

    /// Number of the theme's codes extracted from this source
    pub code_count: usize,

    /// Share of the theme's codes coming from this source (0.0 to 1.0)
    pub influence: f32,
}

/// Provenance of a theme: which sources support it and how strongly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ThemeProvenance {
    /// Contributions ordered by descending influence, then source id
    pub contributions: Vec<SourceContribution>,

    /// Number of distinct supporting sources
    pub source_count: usize,

    /// Influence of the single strongest source
    pub dominant_influence: f32,
}

/// A theme candidate built from a cluster of codes.
///
/// Candidates are created during theme generation, re-labeled and re-scored
/// during refinement and become immutable once provenance is assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTheme {
    /// Theme identifier (e.g., "theme-3")
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Short description built from member codes
    pub description: String,

    /// Most frequent terms of the member codes
    pub keywords: Vec<String>,

    /// One sentence definition of the theme
    pub definition: String,

    /// Member codes (owned)
    pub codes: Vec<InitialCode>,

    /// Mean embedding of member codes
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub centroid: Vec<f32>,

    /// Distinct source ids of member codes, sorted
    pub source_ids: Vec<String>,

    /// Mean pairwise cosine similarity of member codes (0.0 to 1.0)
    pub coherence_score: f32,

    /// Set when the theme rests on too little data to be trusted
    #[serde(default)]
    pub low_confidence: bool,

    /// Per-source support, filled in during provenance assembly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ThemeProvenance>,
}

impl CandidateTheme {
    /// Recompute `source_ids` from the member codes.
    pub fn refresh_source_ids(&mut self) {
        let mut ids: Vec<String> = self.codes.iter().map(|c| c.source_id.clone()).collect();
        ids.sort();
        ids.dedup();
        self.source_ids = ids;
    }

    /// Number of member codes.
    pub fn size(&self) -> usize {
        self.codes.len()
    }
}

/// Statistics recorded for one execution of a stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageStats {
    /// Stage name (e.g., "theme_generation")
    pub stage: String,

    /// Iteration number for looping stages (1-based, 0 for one-shot stages)
    pub iteration: usize,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Number of items that entered the stage
    pub items_in: usize,

    /// Number of items the stage produced
    pub items_out: usize,

    /// Stage-specific counters
    pub details: BTreeMap<String, f64>,
}

/// Final status of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage ran to completion
    Complete,

    /// A stage failed or timed out; downstream stages were skipped
    Failed {
        /// Stage that failed
        stage: String,

        /// Human-readable cause
        reason: String,
    },
}

impl RunStatus {
    /// Whether the run finished every stage.
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Complete)
    }
}

/// Terminal artifact of an extraction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Unique run identifier
    pub run_id: String,

    /// Research purpose the run was configured for
    pub purpose: ResearchPurpose,

    /// Accepted themes, ordered by descending coherence
    pub themes: Vec<CandidateTheme>,

    /// Overall quality score (0.0 to 1.0)
    pub quality_score: f32,

    /// Whether the saturation criterion stopped the iteration
    pub saturation_reached: bool,

    /// Statistics per executed stage
    pub per_stage_stats: Vec<StageStats>,

    /// Completion status; `Failed` is the error flag for partial results
    pub status: RunStatus,

    /// Number of theme generation iterations executed
    pub iterations: usize,

    /// Set when clustering had to collapse to a single cluster
    pub low_confidence: bool,

    /// Name of the embedding provider that produced the compared vectors
    pub embedding_provider: String,

    /// Run start time
    pub started_at: DateTime<Utc>,

    /// Run end time
    pub finished_at: DateTime<Utc>,
}

impl ExtractionResult {
    /// Number of accepted themes.
    pub fn theme_count(&self) -> usize {
        self.themes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_word_count() {
        let source = SourceContent::new("s1", "  three  words here ", ContentKind::Abstract);
        assert_eq!(source.word_count, 3);
        assert!(source.title.is_none());
    }

    #[test]
    fn test_embedding_norm_precomputed() {
        let embedding = Embedding::new(vec![3.0, 4.0]);
        assert!((embedding.norm() - 5.0).abs() < 1e-6);
        assert_eq!(embedding.dimension(), 2);
        assert!(embedding.is_finite());

        let bad = Embedding::new(vec![f32::NAN, 1.0]);
        assert!(!bad.is_finite());
    }

    #[test]
    fn test_refresh_source_ids_sorted_and_deduplicated() {
        let mut theme = CandidateTheme {
            id: "theme-1".to_string(),
            label: "Label".to_string(),
            description: String::new(),
            keywords: vec![],
            definition: String::new(),
            codes: vec![
                InitialCode::new("c1", "a", "a", "s2"),
                InitialCode::new("c2", "b", "b", "s1"),
                InitialCode::new("c3", "c", "c", "s2"),
            ],
            centroid: vec![],
            source_ids: vec![],
            coherence_score: 0.5,
            low_confidence: false,
            provenance: None,
        };
        theme.refresh_source_ids();
        assert_eq!(theme.source_ids, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_run_status_serialization() {
        let status = RunStatus::Failed {
            stage: "theme_review".to_string(),
            reason: "timed out".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
        assert!(!status.is_complete());
        assert!(RunStatus::Complete.is_complete());
    }
}
