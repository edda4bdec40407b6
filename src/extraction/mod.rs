//! Code extraction oracle boundary.
//!
//! An oracle turns one source into candidate codes. It may be a rule engine
//! ([`keyword::KeywordCodeExtractor`]) or a language model
//! ([`llm::LlmCodeOracle`]). Either way its response is untyped JSON, and
//! nothing from it reaches the numeric stages before [`validate_codes`] has
//! checked it against the code schema:
//!
//! ```text
//! { "codes": [ { "label": str, "description": str, "confidence"?: 0..1 } ] }
//! ```
//!
//! A bare array of code objects is accepted as well.

pub mod guarded;
pub mod keyword;
pub mod llm;

use crate::config::{ExtractionFocus, ResearchPurpose, ResolvedConfig, ThemeGranularity};
use crate::models::{InitialCode, SourceContent};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Longest label kept; longer labels are cut at a word boundary.
pub const MAX_LABEL_CHARS: usize = 80;

/// Longest description kept; longer descriptions are cut.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Errors that can occur while extracting codes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OracleError {
    /// The oracle could not be reached or failed internally
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    /// The oracle asked us to slow down
    #[error("Oracle rate limited: {0}")]
    RateLimited(String),

    /// The response does not follow the code schema at all
    #[error("Invalid oracle response: {0}")]
    InvalidResponse(String),

    /// Configuration error (e.g., missing API key)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The oracle's circuit is open; the call was not attempted
    #[error("Oracle circuit open: {0}")]
    CircuitOpen(String),
}

impl OracleError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Unavailable(_) | OracleError::RateLimited(_))
    }
}

/// Result type for oracle operations.
pub type OracleResult<T> = Result<T, OracleError>;

/// What the run wants from the oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionContext {
    pub purpose: ResearchPurpose,
    pub focus: ExtractionFocus,
    pub granularity: ThemeGranularity,

    /// Codes reporting a lower confidence are dropped
    pub min_confidence: f32,

    /// Codes kept per source
    pub max_codes: usize,
}

impl ExtractionContext {
    /// Context for a resolved run configuration.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let purpose_config = &config.purpose_config;
        let max_codes = match purpose_config.theme_granularity {
            ThemeGranularity::Fine => 8,
            ThemeGranularity::Medium => 5,
            ThemeGranularity::Coarse => 3,
            ThemeGranularity::Adaptive => 6,
        };
        Self {
            purpose: config.purpose,
            focus: purpose_config.extraction_focus,
            granularity: purpose_config.theme_granularity,
            min_confidence: purpose_config.min_confidence,
            max_codes,
        }
    }

    /// Code budget for a source of the given length.
    ///
    /// Adaptive granularity scales with the text: one code per forty words,
    /// between two and `max_codes`.
    pub fn code_budget(&self, word_count: usize) -> usize {
        match self.granularity {
            ThemeGranularity::Adaptive => (word_count / 40).clamp(2, self.max_codes.max(2)),
            _ => self.max_codes,
        }
    }
}

/// Trait for code extraction oracles.
#[async_trait]
pub trait CodeExtractionOracle: Send + Sync {
    /// Extract raw codes for one source.
    ///
    /// # Returns
    /// Untyped JSON following the code schema; it is validated by the caller
    ///
    /// # Errors
    /// Returns `OracleError` if the oracle cannot produce a response
    async fn extract_codes(
        &self,
        source: &SourceContent,
        context: &ExtractionContext,
    ) -> OracleResult<Value>;

    /// Get the oracle name for logging.
    fn name(&self) -> &str;
}

/// Codes that survived validation plus what happened to the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedCodes {
    pub codes: Vec<InitialCode>,

    /// Entries missing required fields or with invalid values
    pub rejected: usize,

    /// Entries kept after whitespace or length repair
    pub repaired: usize,

    /// Entries below the minimum confidence
    pub low_confidence: usize,

    /// Entries beyond the per-source budget
    pub truncated: usize,
}

/// Collapse runs of whitespace and trim.
fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `max` characters, preferring a word boundary.
fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    match cut.rfind(' ') {
        Some(space) if space > 0 => cut[..space].to_string(),
        _ => cut,
    }
}

fn string_field(entry: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    entry.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Validate and coerce a raw oracle response into codes.
///
/// Codes get ids `"{source_id}#{n}"` in response order, so the same response
/// always yields the same ids.
///
/// # Arguments
/// * `raw` - Untyped oracle output
/// * `source_id` - Source the codes belong to
/// * `min_confidence` - Entries with a lower `confidence` are dropped
/// * `max_codes` - Codes kept at most
///
/// # Errors
/// Returns `OracleError::InvalidResponse` if the response is neither a code
/// array nor an object with a `codes` array. Problems with single entries are
/// counted, not raised.
pub fn validate_codes(
    raw: &Value,
    source_id: &str,
    min_confidence: f32,
    max_codes: usize,
) -> OracleResult<ValidatedCodes> {
    let entries = match raw {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("codes") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(OracleError::InvalidResponse(
                    "expected an object with a 'codes' array".to_string(),
                ))
            }
        },
        other => {
            return Err(OracleError::InvalidResponse(format!(
                "expected a JSON array or object, got {}",
                type_name(other)
            )))
        }
    };

    let mut result = ValidatedCodes::default();
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        let Some(entry) = entry.as_object() else {
            result.rejected += 1;
            continue;
        };
        let (Some(raw_label), Some(raw_description)) = (
            string_field(entry, "label"),
            string_field(entry, "description"),
        ) else {
            result.rejected += 1;
            continue;
        };

        let confidence = match entry.get("confidence") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_f64() {
                Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => Some(c as f32),
                _ => {
                    result.rejected += 1;
                    continue;
                }
            },
        };
        if confidence.is_some_and(|c| c < min_confidence) {
            result.low_confidence += 1;
            continue;
        }

        let label = clean(&raw_label);
        let description = clean(&raw_description);
        if label.is_empty() || description.is_empty() {
            result.rejected += 1;
            continue;
        }
        if !seen.insert(format!("{}\u{0}{}", label.to_lowercase(), description.to_lowercase())) {
            result.rejected += 1;
            continue;
        }
        if result.codes.len() >= max_codes {
            result.truncated += 1;
            continue;
        }

        let short_label = shorten(&label, MAX_LABEL_CHARS);
        let short_description = shorten(&description, MAX_DESCRIPTION_CHARS);
        if short_label != raw_label || short_description != raw_description {
            result.repaired += 1;
        }

        let id = format!("{}#{}", source_id, result.codes.len() + 1);
        result
            .codes
            .push(InitialCode::new(id, short_label, short_description, source_id));
    }

    debug!(
        source = %source_id,
        kept = result.codes.len(),
        rejected = result.rejected,
        repaired = result.repaired,
        low_confidence = result.low_confidence,
        "Validated oracle response"
    );
    Ok(result)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
