//! Purpose-adaptive configuration resolution.
//!
//! A run is parameterised by a [`ResearchPurpose`] plus optional caller
//! overrides. [`resolve`] turns the pair into a [`ResolvedConfig`] that is
//! immutable for the rest of the run.
//!
//! Resolution is strict. Every rule violation is a [`ValidationError`] naming
//! the offending field and value; nothing is silently clamped or defaulted:
//!
//! 1. every numeric override must be finite (checked for all fields before
//!    any range check),
//! 2. count-valued fields must be integers,
//! 3. enum-valued fields are parsed against the canonical variant lists,
//! 4. the fully resolved configuration is re-validated as a whole to catch
//!    cross-field violations such as `min_themes > max_themes`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for any theme count.
pub const MAX_THEME_COUNT: usize = 200;

/// Upper bound for the number of sources a run may process.
pub const MAX_SOURCE_LIMIT: usize = 100_000;

/// Hard ceiling on theme generation iterations, whatever the overrides say.
pub const HARD_ITERATION_CEILING: usize = 50;

/// Default fraction of unembedded items tolerated before a stage fails.
pub const DEFAULT_UNEMBEDDED_CEILING: f32 = 0.5;

/// Errors raised while resolving or validating a configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A numeric value is NaN or infinite
    #[error("Field '{field}' must be a finite number, got {value}")]
    NotFinite { field: String, value: f64 },

    /// A count-valued field has a fractional part
    #[error("Field '{field}' must be an integer, got {value}")]
    NotInteger { field: String, value: f64 },

    /// A value lies outside its allowed range
    #[error("Field '{field}' is out of range: got {value}, expected {expected}")]
    OutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    /// A string does not name a variant of the canonical enumeration
    #[error("Field '{field}' has unknown value '{value}', expected one of: {expected}")]
    UnknownVariant {
        field: String,
        value: String,
        expected: String,
    },

    /// An override key that does not exist
    #[error("Unknown override field '{field}'")]
    UnknownField { field: String },

    /// A value that could not be parsed at all
    #[error("Field '{field}' has unparseable value '{value}'")]
    Unparseable { field: String, value: String },

    /// Individually valid fields that contradict each other once combined
    #[error("Inconsistent configuration ({fields}): {detail}")]
    Inconsistent { fields: String, detail: String },
}

/// Result type for configuration operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Implements `as_str`, `Display`, `FromStr` and the canonical `ALL` list for
/// a closed enumeration. Parsing accepts snake_case, kebab-case and any
/// letter case, and reports the canonical list on failure.
macro_rules! canonical_enum {
    ($ty:ident, $field:literal, [$($variant:ident => $name:literal),+ $(,)?]) => {
        impl $ty {
            /// Canonical list of every variant.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Canonical snake_case name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }

            /// Comma separated canonical names, for error messages.
            pub fn canonical_names() -> String {
                Self::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_lowercase().replace('-', "_");
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| ValidationError::UnknownVariant {
                        field: $field.to_string(),
                        value: s.to_string(),
                        expected: Self::canonical_names(),
                    })
            }
        }
    };
}

/// Research methodology profile selected by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPurpose {
    /// Q-methodology concourse generation (many fine-grained statements)
    QMethodology,

    /// Survey item construction (few, broad constructs)
    SurveyConstruction,

    /// Reflexive qualitative analysis driven by saturation
    QualitativeAnalysis,

    /// Literature synthesis / meta-analysis
    LiteratureSynthesis,

    /// Hypothesis generation for theory building
    HypothesisGeneration,
}

canonical_enum!(ResearchPurpose, "purpose", [
    QMethodology => "q_methodology",
    SurveyConstruction => "survey_construction",
    QualitativeAnalysis => "qualitative_analysis",
    LiteratureSynthesis => "literature_synthesis",
    HypothesisGeneration => "hypothesis_generation",
]);

/// How strictly themes are validated before acceptance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRigor {
    Standard,
    Rigorous,
    PublicationReady,
}

canonical_enum!(ValidationRigor, "validation_rigor", [
    Standard => "standard",
    Rigorous => "rigorous",
    PublicationReady => "publication_ready",
]);

impl ValidationRigor {
    /// Minimum coherence a theme needs to be accepted under this rigor.
    pub fn min_coherence(&self) -> f32 {
        match self {
            ValidationRigor::Standard => 0.30,
            ValidationRigor::Rigorous => 0.40,
            ValidationRigor::PublicationReady => 0.50,
        }
    }
}

/// What the extraction should optimise for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFocus {
    Breadth,
    Depth,
    Saturation,
}

canonical_enum!(ExtractionFocus, "extraction_focus", [
    Breadth => "breadth",
    Depth => "depth",
    Saturation => "saturation",
]);

/// Expected granularity of the resulting themes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThemeGranularity {
    Fine,
    Medium,
    Coarse,
    Adaptive,
}

canonical_enum!(ThemeGranularity, "theme_granularity", [
    Fine => "fine",
    Medium => "medium",
    Coarse => "coarse",
    Adaptive => "adaptive",
]);

/// Inclusive range of acceptable theme counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThemeRange {
    /// Minimum number of themes (inclusive)
    pub min: usize,

    /// Maximum number of themes (inclusive)
    pub max: usize,
}

impl ThemeRange {
    /// Create a new range.
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Check if a count falls within this range.
    pub fn contains(&self, count: usize) -> bool {
        count >= self.min && count <= self.max
    }
}

/// Per-purpose extraction profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurposeConfig {
    /// Target number of themes
    pub target_theme_range: ThemeRange,

    /// Validation rigor, which sets the default acceptance threshold
    pub validation_rigor: ValidationRigor,

    /// Minimum confidence an extracted code needs to be kept
    pub min_confidence: f32,

    /// What the extraction optimises for
    pub extraction_focus: ExtractionFocus,

    /// Expected theme granularity
    pub theme_granularity: ThemeGranularity,
}

/// Saturation stopping rule parameters.
///
/// The marginal new-theme yield needed to keep iterating is a parameter
/// per purpose rather than a fixed constant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaturationPolicy {
    /// Sources added to the analysis window at each iteration
    pub sources_per_iteration: usize,

    /// Iterations yielding fewer newly accepted themes than this saturate
    pub min_new_themes: usize,

    /// Maximum number of theme generation iterations
    pub max_iterations: usize,

    /// Accepted themes whose centroid similarity to every previously
    /// accepted theme is below this value count as new
    pub novelty_threshold: f32,
}

impl ResearchPurpose {
    /// Built-in profile for this purpose.
    pub fn base_config(&self) -> PurposeConfig {
        let (min, max, rigor, focus, granularity, min_confidence) = match self {
            ResearchPurpose::QMethodology => (
                30,
                80,
                ValidationRigor::Standard,
                ExtractionFocus::Breadth,
                ThemeGranularity::Fine,
                0.5,
            ),
            ResearchPurpose::SurveyConstruction => (
                5,
                15,
                ValidationRigor::Rigorous,
                ExtractionFocus::Depth,
                ThemeGranularity::Coarse,
                0.6,
            ),
            ResearchPurpose::QualitativeAnalysis => (
                5,
                20,
                ValidationRigor::Rigorous,
                ExtractionFocus::Saturation,
                ThemeGranularity::Adaptive,
                0.6,
            ),
            ResearchPurpose::LiteratureSynthesis => (
                10,
                25,
                ValidationRigor::PublicationReady,
                ExtractionFocus::Breadth,
                ThemeGranularity::Medium,
                0.7,
            ),
            ResearchPurpose::HypothesisGeneration => (
                8,
                15,
                ValidationRigor::Rigorous,
                ExtractionFocus::Depth,
                ThemeGranularity::Medium,
                0.6,
            ),
        };
        PurposeConfig {
            target_theme_range: ThemeRange::new(min, max),
            validation_rigor: rigor,
            min_confidence,
            extraction_focus: focus,
            theme_granularity: granularity,
        }
    }

    /// Built-in saturation policy for this purpose.
    pub fn saturation_policy(&self) -> SaturationPolicy {
        let (sources_per_iteration, min_new_themes, max_iterations, novelty_threshold) = match self
        {
            ResearchPurpose::QMethodology => (25, 2, 12, 0.85),
            ResearchPurpose::SurveyConstruction => (20, 1, 8, 0.80),
            ResearchPurpose::QualitativeAnalysis => (50, 1, 10, 0.80),
            ResearchPurpose::LiteratureSynthesis => (40, 1, 10, 0.80),
            ResearchPurpose::HypothesisGeneration => (30, 1, 8, 0.80),
        };
        SaturationPolicy {
            sources_per_iteration,
            min_new_themes,
            max_iterations,
            novelty_threshold,
        }
    }
}

/// Caller-supplied overrides.
///
/// Numeric fields are `f64` on purpose: overrides arrive from untyped
/// sources (JSON, CLI) and must be checked for NaN, infinity and fractional
/// counts before they are converted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default, alias = "minThemes")]
    pub min_themes: Option<f64>,

    #[serde(default, alias = "maxThemes")]
    pub max_themes: Option<f64>,

    /// Maximum number of sources (paper limit)
    #[serde(default, alias = "maxSources", alias = "paperLimit")]
    pub max_sources: Option<f64>,

    /// Minimum coherence to accept a theme; replaces the rigor default
    #[serde(default, alias = "qualityThreshold")]
    pub quality_threshold: Option<f64>,

    #[serde(default, alias = "minConfidence")]
    pub min_confidence: Option<f64>,

    #[serde(default, alias = "validationRigor")]
    pub validation_rigor: Option<String>,

    #[serde(default, alias = "extractionFocus")]
    pub extraction_focus: Option<String>,

    #[serde(default, alias = "themeGranularity")]
    pub theme_granularity: Option<String>,

    #[serde(default, alias = "sourcesPerIteration")]
    pub sources_per_iteration: Option<f64>,

    #[serde(default, alias = "minNewThemes")]
    pub min_new_themes: Option<f64>,

    #[serde(default, alias = "maxIterations")]
    pub max_iterations: Option<f64>,

    #[serde(default, alias = "noveltyThreshold")]
    pub novelty_threshold: Option<f64>,

    #[serde(default, alias = "unembeddedCeiling")]
    pub unembedded_ceiling: Option<f64>,
}

/// Converts camelCase or kebab-case keys to snake_case.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.trim().chars() {
        if ch == '-' {
            out.push('_');
        } else if ch.is_ascii_uppercase() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

impl ConfigOverrides {
    /// Whether no override is set.
    pub fn is_empty(&self) -> bool {
        *self == ConfigOverrides::default()
    }

    /// Parse overrides from a JSON document.
    ///
    /// Unknown keys are rejected. NaN and infinity cannot be written in JSON;
    /// use [`ConfigOverrides::set`] for textual input.
    pub fn from_json(json: &str) -> ValidationResult<Self> {
        serde_json::from_str(json).map_err(|e| ValidationError::Unparseable {
            field: "overrides".to_string(),
            value: e.to_string(),
        })
    }

    /// Build overrides from `key = value` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> ValidationResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut overrides = Self::default();
        for (key, value) in pairs {
            overrides.set(key.as_ref(), value.as_ref())?;
        }
        Ok(overrides)
    }

    /// Set one override from its textual form.
    ///
    /// Numeric values go through `f64` parsing, which accepts `NaN` and
    /// `inf`; those are rejected later by [`resolve`].
    pub fn set(&mut self, key: &str, value: &str) -> ValidationResult<()> {
        let field = canonical_key(key);
        let number = || -> ValidationResult<f64> {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| ValidationError::Unparseable {
                    field: field.clone(),
                    value: value.to_string(),
                })
        };
        match field.as_str() {
            "min_themes" => self.min_themes = Some(number()?),
            "max_themes" => self.max_themes = Some(number()?),
            "max_sources" | "paper_limit" => self.max_sources = Some(number()?),
            "quality_threshold" => self.quality_threshold = Some(number()?),
            "min_confidence" => self.min_confidence = Some(number()?),
            "sources_per_iteration" => self.sources_per_iteration = Some(number()?),
            "min_new_themes" => self.min_new_themes = Some(number()?),
            "max_iterations" => self.max_iterations = Some(number()?),
            "novelty_threshold" => self.novelty_threshold = Some(number()?),
            "unembedded_ceiling" => self.unembedded_ceiling = Some(number()?),
            "validation_rigor" => self.validation_rigor = Some(value.to_string()),
            "extraction_focus" => self.extraction_focus = Some(value.to_string()),
            "theme_granularity" => self.theme_granularity = Some(value.to_string()),
            _ => {
                return Err(ValidationError::UnknownField {
                    field: field.clone(),
                })
            }
        }
        Ok(())
    }

    fn numeric_fields(&self) -> [(&'static str, Option<f64>); 10] {
        [
            ("min_themes", self.min_themes),
            ("max_themes", self.max_themes),
            ("max_sources", self.max_sources),
            ("quality_threshold", self.quality_threshold),
            ("min_confidence", self.min_confidence),
            ("sources_per_iteration", self.sources_per_iteration),
            ("min_new_themes", self.min_new_themes),
            ("max_iterations", self.max_iterations),
            ("novelty_threshold", self.novelty_threshold),
            ("unembedded_ceiling", self.unembedded_ceiling),
        ]
    }
}

/// Fully resolved, validated run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedConfig {
    /// Selected purpose
    pub purpose: ResearchPurpose,

    /// Purpose profile after overrides
    pub purpose_config: PurposeConfig,

    /// Saturation policy after overrides
    pub saturation: SaturationPolicy,

    /// Maximum number of sources processed, if limited
    pub max_sources: Option<usize>,

    /// Minimum coherence for a theme to be accepted
    pub quality_threshold: f32,

    /// Fraction of unembedded items that fails a stage
    pub unembedded_ceiling: f32,
}

impl ResolvedConfig {
    /// Target theme range, which is also the clustering `k` range.
    pub fn theme_range(&self) -> ThemeRange {
        self.purpose_config.target_theme_range
    }

    /// Validate the configuration as a whole.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> ValidationResult<()> {
        let range = self.purpose_config.target_theme_range;
        if range.min == 0 {
            return Err(out_of_range("min_themes", range.min, "at least 1"));
        }
        if range.max > MAX_THEME_COUNT {
            return Err(out_of_range(
                "max_themes",
                range.max,
                &format!("at most {}", MAX_THEME_COUNT),
            ));
        }
        if range.min > range.max {
            return Err(ValidationError::Inconsistent {
                fields: "min_themes, max_themes".to_string(),
                detail: format!(
                    "min_themes ({}) is greater than max_themes ({})",
                    range.min, range.max
                ),
            });
        }
        check_unit_interval("quality_threshold", self.quality_threshold as f64)?;
        check_unit_interval("min_confidence", self.purpose_config.min_confidence as f64)?;
        check_unit_interval("unembedded_ceiling", self.unembedded_ceiling as f64)?;
        if !(self.saturation.novelty_threshold > 0.0 && self.saturation.novelty_threshold <= 1.0) {
            return Err(out_of_range(
                "novelty_threshold",
                self.saturation.novelty_threshold,
                "(0, 1]",
            ));
        }
        if self.saturation.sources_per_iteration == 0 {
            return Err(out_of_range("sources_per_iteration", 0, "at least 1"));
        }
        if self.saturation.min_new_themes == 0 {
            return Err(out_of_range("min_new_themes", 0, "at least 1"));
        }
        if self.saturation.max_iterations == 0
            || self.saturation.max_iterations > HARD_ITERATION_CEILING
        {
            return Err(out_of_range(
                "max_iterations",
                self.saturation.max_iterations,
                &format!("between 1 and {}", HARD_ITERATION_CEILING),
            ));
        }
        if let Some(limit) = self.max_sources {
            if limit == 0 || limit > MAX_SOURCE_LIMIT {
                return Err(out_of_range(
                    "max_sources",
                    limit,
                    &format!("between 1 and {}", MAX_SOURCE_LIMIT),
                ));
            }
        }
        Ok(())
    }
}

fn out_of_range(field: &str, value: impl fmt::Display, expected: &str) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn check_unit_interval(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite {
            field: field.to_string(),
            value,
        });
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(out_of_range(field, value, "[0, 1]"));
    }
    Ok(())
}

fn to_count(field: &str, value: f64, min: usize, max: usize) -> ValidationResult<usize> {
    if value.fract() != 0.0 {
        return Err(ValidationError::NotInteger {
            field: field.to_string(),
            value,
        });
    }
    if value < min as f64 || value > max as f64 {
        return Err(out_of_range(
            field,
            value,
            &format!("an integer between {} and {}", min, max),
        ));
    }
    Ok(value as usize)
}

fn to_fraction(field: &str, value: f64) -> ValidationResult<f32> {
    check_unit_interval(field, value)?;
    Ok(value as f32)
}

/// Resolve a purpose and overrides into a validated configuration.
///
/// # Arguments
/// * `purpose` - The selected research purpose
/// * `overrides` - Optional caller overrides
///
/// # Errors
/// Returns `ValidationError` naming the offending field and value for any
/// non-finite, non-integer, out-of-range or unknown value, and for
/// cross-field violations of the resolved configuration.
pub fn resolve(
    purpose: ResearchPurpose,
    overrides: &ConfigOverrides,
) -> ValidationResult<ResolvedConfig> {
    // Finiteness of every numeric field before any range check
    for (field, value) in overrides.numeric_fields() {
        if let Some(value) = value {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite {
                    field: field.to_string(),
                    value,
                });
            }
        }
    }

    let mut purpose_config = purpose.base_config();
    let mut saturation = purpose.saturation_policy();
    let mut max_sources = None;

    if let Some(v) = overrides.min_themes {
        purpose_config.target_theme_range.min = to_count("min_themes", v, 1, MAX_THEME_COUNT)?;
    }
    if let Some(v) = overrides.max_themes {
        purpose_config.target_theme_range.max = to_count("max_themes", v, 1, MAX_THEME_COUNT)?;
    }
    if let Some(v) = overrides.max_sources {
        max_sources = Some(to_count("max_sources", v, 1, MAX_SOURCE_LIMIT)?);
    }
    if let Some(v) = overrides.sources_per_iteration {
        saturation.sources_per_iteration =
            to_count("sources_per_iteration", v, 1, MAX_SOURCE_LIMIT)?;
    }
    if let Some(v) = overrides.min_new_themes {
        saturation.min_new_themes = to_count("min_new_themes", v, 1, MAX_THEME_COUNT)?;
    }
    if let Some(v) = overrides.max_iterations {
        saturation.max_iterations = to_count("max_iterations", v, 1, HARD_ITERATION_CEILING)?;
    }
    if let Some(v) = overrides.novelty_threshold {
        saturation.novelty_threshold = to_fraction("novelty_threshold", v)?;
    }
    if let Some(v) = overrides.min_confidence {
        purpose_config.min_confidence = to_fraction("min_confidence", v)?;
    }
    if let Some(name) = &overrides.validation_rigor {
        purpose_config.validation_rigor = name.parse()?;
    }
    if let Some(name) = &overrides.extraction_focus {
        purpose_config.extraction_focus = name.parse()?;
    }
    if let Some(name) = &overrides.theme_granularity {
        purpose_config.theme_granularity = name.parse()?;
    }

    // The rigor may have changed above, so the threshold default is derived last
    let quality_threshold = match overrides.quality_threshold {
        Some(v) => to_fraction("quality_threshold", v)?,
        None => purpose_config.validation_rigor.min_coherence(),
    };
    let unembedded_ceiling = match overrides.unembedded_ceiling {
        Some(v) => to_fraction("unembedded_ceiling", v)?,
        None => DEFAULT_UNEMBEDDED_CEILING,
    };

    let resolved = ResolvedConfig {
        purpose,
        purpose_config,
        saturation,
        max_sources,
        quality_threshold,
        unembedded_ceiling,
    };
    resolved.validate()?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_purpose_resolves_without_overrides() {
        for purpose in ResearchPurpose::ALL {
            let config = resolve(*purpose, &ConfigOverrides::default()).unwrap();
            assert_eq!(config.purpose, *purpose);
            assert!(config.theme_range().min <= config.theme_range().max);
            assert_eq!(
                config.quality_threshold,
                config.purpose_config.validation_rigor.min_coherence()
            );
        }
    }

    #[test]
    fn test_qualitative_defaults() {
        let config = resolve(ResearchPurpose::QualitativeAnalysis, &ConfigOverrides::default())
            .unwrap();
        assert_eq!(config.theme_range(), ThemeRange::new(5, 20));
        assert_eq!(config.purpose_config.extraction_focus, ExtractionFocus::Saturation);
        assert!(config.max_sources.is_none());
    }

    #[test]
    fn test_nan_quality_threshold_rejected() {
        let overrides = ConfigOverrides::from_pairs([("qualityThreshold", "NaN")]).unwrap();
        let err = resolve(ResearchPurpose::QualitativeAnalysis, &overrides).unwrap_err();
        match err {
            ValidationError::NotFinite { field, value } => {
                assert_eq!(field, "quality_threshold");
                assert!(value.is_nan());
            }
            other => panic!("Expected NotFinite, got {:?}", other),
        }
    }

    #[test]
    fn test_infinity_rejected_before_range_checks() {
        // max_themes is out of range too, but finiteness is checked first
        let overrides = ConfigOverrides {
            max_themes: Some(-3.0),
            min_confidence: Some(f64::INFINITY),
            ..Default::default()
        };
        let err = resolve(ResearchPurpose::SurveyConstruction, &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::NotFinite { ref field, .. } if field == "min_confidence"));
    }

    #[test]
    fn test_non_integer_count_rejected() {
        let overrides = ConfigOverrides {
            max_themes: Some(12.5),
            ..Default::default()
        };
        let err = resolve(ResearchPurpose::SurveyConstruction, &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::NotInteger { ref field, .. } if field == "max_themes"));
    }

    #[test]
    fn test_negative_values_rejected() {
        for (key, value) in [
            ("max_sources", "-1"),
            ("min_confidence", "-0.2"),
            ("quality_threshold", "-0.01"),
            ("min_themes", "-4"),
        ] {
            let overrides = ConfigOverrides::from_pairs([(key, value)]).unwrap();
            let err = resolve(ResearchPurpose::QualitativeAnalysis, &overrides).unwrap_err();
            assert!(
                matches!(err, ValidationError::OutOfRange { ref field, .. } if field == key),
                "{} => {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let overrides = ConfigOverrides {
            validation_rigor: Some("extreme".to_string()),
            ..Default::default()
        };
        let err = resolve(ResearchPurpose::QualitativeAnalysis, &overrides).unwrap_err();
        match err {
            ValidationError::UnknownVariant { field, value, expected } => {
                assert_eq!(field, "validation_rigor");
                assert_eq!(value, "extreme");
                assert!(expected.contains("publication_ready"));
            }
            other => panic!("Expected UnknownVariant, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_field_violation_caught_after_resolution() {
        // Each value is valid on its own; together min > max
        let overrides = ConfigOverrides {
            min_themes: Some(18.0),
            max_themes: Some(9.0),
            ..Default::default()
        };
        let err = resolve(ResearchPurpose::QualitativeAnalysis, &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::Inconsistent { .. }));
        assert!(err.to_string().contains("18"));
    }

    #[test]
    fn test_single_override_conflicting_with_base_range() {
        // max below the purpose default min of 5
        let overrides = ConfigOverrides {
            max_themes: Some(3.0),
            ..Default::default()
        };
        assert!(resolve(ResearchPurpose::QualitativeAnalysis, &overrides).is_err());
    }

    #[test]
    fn test_valid_overrides_applied() {
        let overrides = ConfigOverrides::from_pairs([
            ("min-themes", "4"),
            ("maxThemes", "12"),
            ("validation_rigor", "Publication-Ready"),
            ("paperLimit", "300"),
            ("sources_per_iteration", "25"),
            ("unembedded_ceiling", "0.2"),
        ])
        .unwrap();
        let config = resolve(ResearchPurpose::HypothesisGeneration, &overrides).unwrap();
        assert_eq!(config.theme_range(), ThemeRange::new(4, 12));
        assert_eq!(
            config.purpose_config.validation_rigor,
            ValidationRigor::PublicationReady
        );
        assert_eq!(config.quality_threshold, 0.50);
        assert_eq!(config.max_sources, Some(300));
        assert_eq!(config.saturation.sources_per_iteration, 25);
        assert!((config.unembedded_ceiling - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_explicit_quality_threshold_wins_over_rigor() {
        let overrides = ConfigOverrides {
            quality_threshold: Some(0.65),
            validation_rigor: Some("standard".to_string()),
            ..Default::default()
        };
        let config = resolve(ResearchPurpose::QMethodology, &overrides).unwrap();
        assert!((config.quality_threshold - 0.65).abs() < 1e-6);
    }

    #[test]
    fn test_iteration_ceiling_enforced() {
        let overrides = ConfigOverrides {
            max_iterations: Some((HARD_ITERATION_CEILING + 1) as f64),
            ..Default::default()
        };
        assert!(matches!(
            resolve(ResearchPurpose::QualitativeAnalysis, &overrides),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_override_key() {
        let err = ConfigOverrides::from_pairs([("temperature", "0.2")]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownField {
                field: "temperature".to_string()
            }
        );
    }

    #[test]
    fn test_unparseable_number() {
        let err = ConfigOverrides::from_pairs([("max_themes", "twelve")]).unwrap_err();
        assert!(matches!(err, ValidationError::Unparseable { .. }));
    }

    #[test]
    fn test_overrides_from_json_with_aliases() {
        let overrides =
            ConfigOverrides::from_json(r#"{"minThemes": 6, "extraction_focus": "depth"}"#).unwrap();
        assert_eq!(overrides.min_themes, Some(6.0));
        assert_eq!(overrides.extraction_focus.as_deref(), Some("depth"));
        assert!(ConfigOverrides::from_json(r#"{"bogus": 1}"#).is_err());
        assert!(ConfigOverrides::default().is_empty());
    }

    #[test]
    fn test_purpose_from_str() {
        assert_eq!(
            "qualitative-analysis".parse::<ResearchPurpose>().unwrap(),
            ResearchPurpose::QualitativeAnalysis
        );
        assert_eq!(
            "Q_METHODOLOGY".parse::<ResearchPurpose>().unwrap(),
            ResearchPurpose::QMethodology
        );
        assert!("ethnography".parse::<ResearchPurpose>().is_err());
        assert_eq!(ResearchPurpose::ALL.len(), 5);
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("qualityThreshold"), "quality_threshold");
        assert_eq!(canonical_key("max-themes"), "max_themes");
        assert_eq!(canonical_key("min_new_themes"), "min_new_themes");
    }
}
