//! Semantic coherence of themes.
//!
//! Coherence is the mean pairwise cosine similarity of a theme's code
//! embeddings (Roberts et al., 2019). All `n(n-1)/2` unordered pairs are
//! scored with [`cosine_similarity_optimized`]; the arithmetic mean is the
//! coherence.
//!
//! Policy:
//! - fewer than two codes score [`DEFAULT_COHERENCE`]
//! - codes without embeddings are left out of the pairing, and when more
//!   than half of the codes lack one the score falls back to the default
//! - a NaN or infinite intermediate is a failure for the theme, never a
//!   silently coerced number
//! - negative means are clamped to zero so scores stay in `[0, 1]`

use crate::config::ValidationRigor;
use crate::models::{CandidateTheme, Embedding, InitialCode};
use crate::similarity::cosine_similarity_optimized;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

/// Score for themes too small (or too sparsely embedded) to measure.
pub const DEFAULT_COHERENCE: f32 = 0.5;

/// Largest fraction of unembedded codes still scored from the rest.
pub const MAX_MISSING_FRACTION: f32 = 0.5;

/// Embedded code count from which pairs are scored on rayon.
const PARALLEL_THRESHOLD: usize = 128;

/// Errors raised while scoring a theme.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoherenceError {
    /// NaN or infinity appeared in the computation
    #[error("Non-finite coherence: {0}")]
    NonFinite(String),

    #[error("Code '{code_id}' has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        code_id: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for coherence operations.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

/// Number of unordered pairs among `n` codes.
pub fn pair_count(n: usize) -> usize {
    n.saturating_mul(n.saturating_sub(1)) / 2
}

/// Mean pairwise cosine similarity of the codes' embeddings.
///
/// # Returns
/// A score in `[0, 1]`, or [`DEFAULT_COHERENCE`] when fewer than two codes
/// are present or more than half of them lack embeddings
///
/// # Errors
/// - `CoherenceError::NonFinite` if any embedding or the mean is NaN/infinite
/// - `CoherenceError::DimensionMismatch` if embeddings disagree in dimension
pub fn calculate_theme_coherence(codes: &[InitialCode]) -> CoherenceResult<f32> {
    let n = codes.len();
    if n < 2 {
        return Ok(DEFAULT_COHERENCE);
    }

    let embedded: Vec<(&str, &Embedding)> = codes
        .iter()
        .filter_map(|c| c.embedding.as_ref().map(|e| (c.id.as_str(), e)))
        .collect();
    let missing = n - embedded.len();
    if missing as f32 > n as f32 * MAX_MISSING_FRACTION || embedded.len() < 2 {
        debug!(
            total = n,
            missing,
            "Too many codes lack embeddings; using default coherence"
        );
        return Ok(DEFAULT_COHERENCE);
    }

    let dimension = embedded[0].1.dimension();
    for (id, embedding) in &embedded {
        if embedding.dimension() != dimension {
            return Err(CoherenceError::DimensionMismatch {
                code_id: id.to_string(),
                expected: dimension,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_finite() {
            return Err(CoherenceError::NonFinite(format!(
                "embedding of code '{}' contains NaN or infinite values",
                id
            )));
        }
    }

    let m = embedded.len();
    let row_sum = |i: usize| -> f64 {
        ((i + 1)..m)
            .map(|j| cosine_similarity_optimized(embedded[i].1, embedded[j].1) as f64)
            .sum()
    };
    let total: f64 = if m >= PARALLEL_THRESHOLD {
        (0..m).into_par_iter().map(row_sum).sum()
    } else {
        (0..m).map(row_sum).sum()
    };

    let mean = total / pair_count(m) as f64;
    if !mean.is_finite() {
        return Err(CoherenceError::NonFinite(format!(
            "mean over {} pairs is {}",
            pair_count(m),
            mean
        )));
    }
    Ok((mean as f32).clamp(0.0, 1.0))
}

/// Verdict on a single theme.
#[derive(Debug, Clone, PartialEq)]
pub enum ThemeVerdict {
    /// Coherence meets the threshold
    Accepted(f32),

    /// Coherence is below the threshold
    Rejected(f32),

    /// Coherence could not be computed; the theme must be excluded
    Failed(CoherenceError),
}

impl ThemeVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ThemeVerdict::Accepted(_))
    }

    /// The computed score, if any.
    pub fn score(&self) -> Option<f32> {
        match self {
            ThemeVerdict::Accepted(s) | ThemeVerdict::Rejected(s) => Some(*s),
            ThemeVerdict::Failed(_) => None,
        }
    }
}

/// Accepts or rejects themes against a coherence threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoherenceValidator {
    threshold: f32,
}

impl CoherenceValidator {
    /// Validator with an explicit minimum coherence.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Validator using the minimum coherence of a rigor level.
    pub fn for_rigor(rigor: ValidationRigor) -> Self {
        Self::new(rigor.min_coherence())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score a theme and decide whether it is kept.
    ///
    /// Failures are logged with their cause here so callers only need to
    /// drop the theme.
    pub fn validate(&self, theme: &CandidateTheme) -> ThemeVerdict {
        match calculate_theme_coherence(&theme.codes) {
            Ok(score) if score >= self.threshold => ThemeVerdict::Accepted(score),
            Ok(score) => {
                debug!(
                    theme = %theme.id,
                    score,
                    threshold = self.threshold,
                    "Theme below coherence threshold"
                );
                ThemeVerdict::Rejected(score)
            }
            Err(e) => {
                warn!(theme = %theme.id, error = %e, "Excluding theme: coherence computation failed");
                ThemeVerdict::Failed(e)
            }
        }
    }
}
