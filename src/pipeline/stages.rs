//! Stage implementations.
//!
//! Every stage takes the run context plus its inputs, records its own
//! [`StageStats`] and reports progress. Stages return [`StageError`] for
//! cancellation and for failures that end the run; item-level problems are
//! absorbed and counted.

use super::context::RunContext;
use super::saturation::{SaturationCheck, SaturationTracker};
use super::state::Stage;
use crate::clustering::ClusteringEngine;
use crate::coherence::{calculate_theme_coherence, CoherenceValidator, ThemeVerdict};
use crate::embedding::service::{EmbedItem, EmbeddingService};
use crate::embedding::EmbeddingError;
use crate::extraction::guarded::GuardedOracle;
use crate::extraction::{validate_codes, ExtractionContext, OracleError};
use crate::labeling::LocalLabeler;
use crate::models::{
    CandidateTheme, ContentKind, Embedding, InitialCode, SourceContent, SourceContribution,
    StageStats, ThemeProvenance,
};
use crate::similarity::{calculate_centroid, checked_cosine_similarity, cosine_similarity};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

/// Accepted themes whose centroids are more similar than this are merged
/// during refinement.
pub const MERGE_SIMILARITY: f32 = 0.9;

/// Weight of mean coherence in the quality score; source coverage gets the rest.
pub const COHERENCE_WEIGHT: f32 = 0.7;

/// Longest source excerpt embedded during familiarization, in characters.
const SOURCE_EMBED_CHARS: usize = 8_000;

/// Why a stage stopped early.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageError {
    Cancelled,
    TimedOut(Duration),
    Failed(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Cancelled => f.write_str("cancelled"),
            StageError::TimedOut(limit) => write!(f, "timed out after {:?}", limit),
            StageError::Failed(reason) => f.write_str(reason),
        }
    }
}

impl From<EmbeddingError> for StageError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Cancelled => StageError::Cancelled,
            other => StageError::Failed(other.to_string()),
        }
    }
}

pub(crate) type StageResult<T> = Result<T, StageError>;

/// Run a stage future under a time limit.
///
/// A zero limit expires before the stage starts.
pub(crate) async fn with_timeout<T, F>(limit: Duration, stage: F) -> StageResult<T>
where
    F: Future<Output = StageResult<T>>,
{
    if limit.is_zero() {
        return Err(StageError::TimedOut(limit));
    }
    match tokio::time::timeout(limit, stage).await {
        Ok(result) => result,
        Err(_) => Err(StageError::TimedOut(limit)),
    }
}

fn stats(
    stage: Stage,
    iteration: usize,
    started: Instant,
    items_in: usize,
    items_out: usize,
    details: BTreeMap<String, f64>,
) -> StageStats {
    StageStats {
        stage: stage.as_str().to_string(),
        iteration,
        duration_ms: started.elapsed().as_millis() as u64,
        items_in,
        items_out,
        details,
    }
}

fn details<const N: usize>(pairs: [(&str, f64); N]) -> BTreeMap<String, f64> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

// ===== Familiarization =====

/// What source preparation removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreparedCounts {
    pub received: usize,
    pub duplicate_ids: usize,
    pub duplicate_texts: usize,
    pub empty: usize,
    pub capped: usize,
}

/// Drop empty and duplicate sources and apply the source limit.
///
/// The first occurrence of an id or of a normalized text wins, so the input
/// order decides which duplicate survives.
pub fn prepare_sources(
    sources: Vec<SourceContent>,
    max_sources: Option<usize>,
) -> (Vec<SourceContent>, PreparedCounts) {
    let mut counts = PreparedCounts {
        received: sources.len(),
        ..Default::default()
    };
    let mut ids = HashSet::new();
    let mut texts = HashSet::new();
    let mut kept = Vec::with_capacity(sources.len());

    for source in sources {
        let normalized = crate::embedding::normalize_text(&source.text);
        if normalized.is_empty() || source.id.trim().is_empty() {
            counts.empty += 1;
            continue;
        }
        if !ids.insert(source.id.clone()) {
            counts.duplicate_ids += 1;
            continue;
        }
        if !texts.insert(normalized) {
            counts.duplicate_texts += 1;
            continue;
        }
        kept.push(source);
    }

    if let Some(limit) = max_sources {
        if kept.len() > limit {
            counts.capped = kept.len() - limit;
            kept.truncate(limit);
        }
    }
    (kept, counts)
}

/// Embed the sources and record corpus statistics.
pub(crate) async fn familiarize(
    ctx: &mut RunContext,
    embeddings: &EmbeddingService,
    sources: &[SourceContent],
    prepared: PreparedCounts,
) -> StageResult<()> {
    let started = Instant::now();
    let total_words: usize = sources.iter().map(|s| s.word_count).sum();
    let full_texts = sources
        .iter()
        .filter(|s| s.content_kind == ContentKind::FullText)
        .count();
    let mean_words = total_words as f64 / sources.len().max(1) as f64;

    ctx.emit(
        Stage::Familiarization,
        0.0,
        format!("Reading {} sources", sources.len()),
        details([
            ("sources", sources.len() as f64),
            ("total_words", total_words as f64),
        ]),
    );

    let items: Vec<EmbedItem> = sources
        .iter()
        .map(|s| EmbedItem::new(s.id.clone(), s.text.chars().take(SOURCE_EMBED_CHARS).collect::<String>()))
        .collect();
    let ceiling = ctx.config().unembedded_ceiling;
    let outcome = embeddings
        .embed_items(items, ceiling, ctx.cancel_token())
        .await?;

    let vectors: Vec<&[f32]> = sources
        .iter()
        .filter_map(|s| outcome.embeddings.get(&s.id).map(Embedding::vector))
        .collect();
    let diversity = corpus_diversity(&vectors);

    let live = details([
        ("sources", sources.len() as f64),
        ("total_words", total_words as f64),
        ("mean_words", mean_words),
        ("abstracts", (sources.len() - full_texts) as f64),
        ("full_texts", full_texts as f64),
        ("corpus_diversity", diversity),
        ("embedded", outcome.embeddings.len() as f64),
        ("unembedded", outcome.failed.len() as f64),
        ("cache_hits", outcome.cache_hits as f64),
        ("duplicates", (prepared.duplicate_ids + prepared.duplicate_texts) as f64),
        ("empty", prepared.empty as f64),
        ("capped", prepared.capped as f64),
    ]);
    info!(
        sources = sources.len(),
        total_words,
        diversity,
        "Familiarization complete"
    );
    ctx.emit(
        Stage::Familiarization,
        1.0,
        format!("Read {} sources ({} words)", sources.len(), total_words),
        live.clone(),
    );
    ctx.record(stats(
        Stage::Familiarization,
        0,
        started,
        prepared.received,
        sources.len(),
        live,
    ));
    Ok(())
}

/// Mean cosine distance of source embeddings to their centroid.
fn corpus_diversity(vectors: &[&[f32]]) -> f64 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let centroid = calculate_centroid(vectors);
    let total: f64 = vectors
        .iter()
        .map(|v| (1.0 - cosine_similarity(v, &centroid)) as f64)
        .sum();
    let mean = total / vectors.len() as f64;
    if mean.is_finite() {
        mean.max(0.0)
    } else {
        0.0
    }
}

// ===== Initial coding =====

/// Extract, validate and embed codes for every source.
///
/// Codes come back in source order, then response order. Codes that could
/// not be embedded are dropped. Once the oracle's circuit opens, sources not
/// yet dispatched are skipped and counted as oracle failures.
pub(crate) async fn initial_coding(
    ctx: &mut RunContext,
    oracle: &Arc<GuardedOracle>,
    embeddings: &EmbeddingService,
    sources: &[SourceContent],
    concurrency: usize,
) -> StageResult<Vec<InitialCode>> {
    let started = Instant::now();
    let context = ExtractionContext::from_config(ctx.config());
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut cancelled = false;
    let mut skipped = 0usize;
    let report_every = (sources.len() / 10).max(1);

    for (index, source) in sources.iter().enumerate() {
        if ctx.is_cancelled() {
            cancelled = true;
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                cancelled = true;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    cancelled = true;
                    break;
                }
            },
        };
        if oracle.is_isolated() {
            skipped = sources.len() - index;
            warn!(oracle = oracle.name(), skipped, "Oracle circuit open; skipping remaining sources");
            break;
        }

        let oracle = Arc::clone(oracle);
        let source = source.clone();
        let context = context.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let raw = oracle.extract(&source, &context).await;
            (index, raw)
        });

        if (index + 1) % report_every == 0 {
            ctx.emit(
                Stage::InitialCoding,
                0.8 * (index + 1) as f32 / sources.len() as f32,
                format!("Coding source {} of {}", index + 1, sources.len()),
                details([("dispatched", (index + 1) as f64)]),
            );
        }
    }

    // In-flight calls are allowed to finish
    let mut responses: Vec<Option<Value>> = vec![None; sources.len()];
    let mut oracle_failures = skipped;
    let mut refused = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(raw))) => responses[index] = Some(raw),
            Ok((_, Err(OracleError::CircuitOpen(_)))) => {
                oracle_failures += 1;
                refused += 1;
            }
            Ok((index, Err(e))) => {
                oracle_failures += 1;
                warn!(source = %sources[index].id, oracle = oracle.name(), error = %e, "Code extraction failed");
            }
            Err(e) => {
                oracle_failures += 1;
                warn!(error = %e, "Code extraction task failed");
            }
        }
    }
    if cancelled {
        info!("Cancellation requested during initial coding");
        return Err(StageError::Cancelled);
    }

    let mut codes = Vec::new();
    let (mut rejected, mut repaired, mut low_confidence, mut truncated, mut invalid) =
        (0usize, 0usize, 0usize, 0usize, 0usize);
    for (source, raw) in sources.iter().zip(responses) {
        let Some(raw) = raw else { continue };
        let budget = context.code_budget(source.word_count);
        match validate_codes(&raw, &source.id, context.min_confidence, budget) {
            Ok(validated) => {
                rejected += validated.rejected;
                repaired += validated.repaired;
                low_confidence += validated.low_confidence;
                truncated += validated.truncated;
                codes.extend(validated.codes);
            }
            Err(e) => {
                invalid += 1;
                warn!(source = %source.id, error = %e, "Discarding oracle response");
            }
        }
    }

    if codes.is_empty() {
        return Err(StageError::Failed(format!(
            "no codes could be extracted from {} sources ({} oracle failures, {} invalid responses)",
            sources.len(),
            oracle_failures,
            invalid
        )));
    }

    ctx.emit(
        Stage::InitialCoding,
        0.85,
        format!("Embedding {} codes", codes.len()),
        details([("codes", codes.len() as f64)]),
    );
    let items: Vec<EmbedItem> = codes
        .iter()
        .map(|c| EmbedItem::new(c.id.clone(), c.embedding_text()))
        .collect();
    let ceiling = ctx.config().unembedded_ceiling;
    let mut outcome = embeddings
        .embed_items(items, ceiling, ctx.cancel_token())
        .await?;

    let extracted = codes.len();
    let codes: Vec<InitialCode> = codes
        .into_iter()
        .filter_map(|code| {
            let embedding = outcome.embeddings.remove(&code.id)?;
            Some(code.with_embedding(embedding))
        })
        .collect();
    let unembedded = extracted - codes.len();

    let live = details([
        ("codes", codes.len() as f64),
        ("codes_per_source", codes.len() as f64 / sources.len().max(1) as f64),
        ("oracle_failures", oracle_failures as f64),
        ("oracle_isolated", (skipped + refused) as f64),
        ("invalid_responses", invalid as f64),
        ("rejected", rejected as f64),
        ("repaired", repaired as f64),
        ("below_min_confidence", low_confidence as f64),
        ("over_budget", truncated as f64),
        ("unembedded", unembedded as f64),
        ("cache_hits", outcome.cache_hits as f64),
    ]);
    info!(
        codes = codes.len(),
        oracle = oracle.name(),
        oracle_failures,
        rejected,
        unembedded,
        "Initial coding complete"
    );
    ctx.emit(
        Stage::InitialCoding,
        1.0,
        format!("Extracted {} codes", codes.len()),
        live.clone(),
    );
    ctx.record(stats(
        Stage::InitialCoding,
        0,
        started,
        sources.len(),
        codes.len(),
        live,
    ));
    Ok(codes)
}

// ===== Theme generation =====

/// Candidates produced by one generation pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct Generation {
    pub candidates: Vec<CandidateTheme>,
    pub low_confidence: bool,
}

fn new_theme(id: String, codes: Vec<InitialCode>, centroid: Vec<f32>) -> CandidateTheme {
    let mut theme = CandidateTheme {
        id,
        label: String::new(),
        description: String::new(),
        keywords: Vec::new(),
        definition: String::new(),
        codes,
        centroid,
        source_ids: Vec::new(),
        coherence_score: 0.0,
        low_confidence: false,
        provenance: None,
    };
    theme.refresh_source_ids();
    theme
}

/// Cluster the codes of the sources in `window` and label the clusters.
pub(crate) async fn generate_themes(
    ctx: &mut RunContext,
    clustering: &ClusteringEngine,
    labeler: &LocalLabeler,
    codes: &[InitialCode],
    window: &HashSet<String>,
    iteration: usize,
) -> StageResult<Generation> {
    let started = Instant::now();
    let window_codes: Vec<InitialCode> = codes
        .iter()
        .filter(|c| window.contains(&c.source_id))
        .cloned()
        .collect();
    ctx.emit(
        Stage::ThemeGeneration,
        0.0,
        format!(
            "Iteration {}: clustering {} codes from {} sources",
            iteration,
            window_codes.len(),
            window.len()
        ),
        details([
            ("iteration", iteration as f64),
            ("codes", window_codes.len() as f64),
        ]),
    );
    if window_codes.is_empty() {
        debug!(iteration, "No codes in the current window");
        ctx.record(stats(
            Stage::ThemeGeneration,
            iteration,
            started,
            0,
            0,
            details([("window_sources", window.len() as f64)]),
        ));
        return Ok(Generation::default());
    }

    let items_in = window_codes.len();
    let engine = clustering.clone();
    let range = ctx.config().theme_range();
    let outcome = task::spawn_blocking(move || engine.cluster(window_codes, range))
        .await
        .map_err(|e| StageError::Failed(format!("clustering task failed: {}", e)))?
        .map_err(|e| StageError::Failed(e.to_string()))?;

    let low_confidence = outcome.low_confidence;
    let candidates: Vec<CandidateTheme> = outcome
        .clusters
        .into_iter()
        .enumerate()
        .map(|(i, cluster)| {
            let mut theme = new_theme(
                format!("candidate-{}-{}", iteration, i + 1),
                cluster.codes,
                cluster.centroid,
            );
            theme.low_confidence = low_confidence;
            labeler.apply(&mut theme);
            theme
        })
        .collect();

    let live = details([
        ("iteration", iteration as f64),
        ("window_sources", window.len() as f64),
        ("selected_k", outcome.selected_k as f64),
        ("silhouette", outcome.silhouette.unwrap_or(0.0)),
        ("low_confidence", if low_confidence { 1.0 } else { 0.0 }),
    ]);
    ctx.emit(
        Stage::ThemeGeneration,
        1.0,
        format!("Iteration {}: {} candidate themes", iteration, candidates.len()),
        live.clone(),
    );
    ctx.record(stats(
        Stage::ThemeGeneration,
        iteration,
        started,
        items_in,
        candidates.len(),
        live,
    ));
    Ok(Generation {
        candidates,
        low_confidence,
    })
}

// ===== Theme review =====

/// Score candidates, keep the coherent ones and update saturation.
pub(crate) async fn review_themes(
    ctx: &mut RunContext,
    validator: &CoherenceValidator,
    tracker: &mut SaturationTracker,
    candidates: Vec<CandidateTheme>,
    iteration: usize,
) -> StageResult<(Vec<CandidateTheme>, SaturationCheck)> {
    let started = Instant::now();
    let items_in = candidates.len();
    let mut accepted = Vec::new();
    let (mut rejected, mut failed) = (0usize, 0usize);

    for mut theme in candidates {
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        match validator.validate(&theme) {
            ThemeVerdict::Accepted(score) => {
                theme.coherence_score = score;
                accepted.push(theme);
            }
            ThemeVerdict::Rejected(_) => rejected += 1,
            ThemeVerdict::Failed(_) => failed += 1,
        }
    }

    let check = tracker.observe(&accepted);
    let mean_coherence = mean_coherence(&accepted);
    let live = details([
        ("iteration", iteration as f64),
        ("accepted", accepted.len() as f64),
        ("rejected", rejected as f64),
        ("coherence_failures", failed as f64),
        ("threshold", validator.threshold() as f64),
        ("mean_coherence", mean_coherence as f64),
        ("new_themes", check.new_themes as f64),
        ("saturated", if check.saturated() { 1.0 } else { 0.0 }),
    ]);
    info!(
        iteration,
        accepted = accepted.len(),
        rejected,
        failed,
        new_themes = check.new_themes,
        saturation = ?check.reason,
        "Theme review complete"
    );
    ctx.emit(
        Stage::ThemeReview,
        1.0,
        format!(
            "Iteration {}: {} themes accepted, {} new",
            iteration,
            accepted.len(),
            check.new_themes
        ),
        live.clone(),
    );
    ctx.record(stats(
        Stage::ThemeReview,
        iteration,
        started,
        items_in,
        accepted.len(),
        live,
    ));
    Ok((accepted, check))
}

fn mean_coherence(themes: &[CandidateTheme]) -> f32 {
    if themes.is_empty() {
        return 0.0;
    }
    themes.iter().map(|t| t.coherence_score).sum::<f32>() / themes.len() as f32
}

// ===== Refinement =====

fn by_coherence(a: &CandidateTheme, b: &CandidateTheme) -> std::cmp::Ordering {
    b.coherence_score
        .total_cmp(&a.coherence_score)
        .then_with(|| a.id.cmp(&b.id))
}

fn code_centroid(codes: &[InitialCode]) -> Vec<f32> {
    let vectors: Vec<&[f32]> = codes
        .iter()
        .filter_map(|c| c.embedding.as_ref().map(Embedding::vector))
        .collect();
    calculate_centroid(&vectors)
}

/// Merge near-duplicate themes, cap the count and order by coherence.
///
/// Themes are visited most coherent first; each joins the first kept theme
/// whose centroid is more similar than `MERGE_SIMILARITY`, provided the
/// merged theme still clears the threshold.
pub fn refine_themes(
    themes: Vec<CandidateTheme>,
    validator: &CoherenceValidator,
    labeler: &LocalLabeler,
    max_themes: usize,
) -> (Vec<CandidateTheme>, usize) {
    let mut ordered = themes;
    ordered.sort_by(by_coherence);

    let mut kept: Vec<CandidateTheme> = Vec::with_capacity(ordered.len());
    let mut merges = 0usize;
    for theme in ordered {
        let target = kept.iter().position(|k| {
            checked_cosine_similarity(&k.centroid, &theme.centroid)
                .is_some_and(|s| s > MERGE_SIMILARITY)
        });
        let Some(target) = target else {
            kept.push(theme);
            continue;
        };

        let host = &kept[target];
        let mut codes = host.codes.clone();
        codes.extend(theme.codes.iter().cloned());
        codes.sort_by(|a, b| a.id.cmp(&b.id));
        match calculate_theme_coherence(&codes) {
            Ok(score) if score >= validator.threshold() => {
                let centroid = code_centroid(&codes);
                let mut merged = new_theme(host.id.clone(), codes, centroid);
                merged.coherence_score = score;
                merged.low_confidence = host.low_confidence || theme.low_confidence;
                labeler.apply(&mut merged);
                debug!(into = %host.id, from = %theme.id, score, "Merged themes");
                kept[target] = merged;
                merges += 1;
            }
            _ => kept.push(theme),
        }
    }

    kept.sort_by(by_coherence);
    kept.truncate(max_themes);
    (kept, merges)
}

pub(crate) async fn refinement(
    ctx: &mut RunContext,
    validator: &CoherenceValidator,
    labeler: &LocalLabeler,
    accepted: Vec<CandidateTheme>,
) -> StageResult<Vec<CandidateTheme>> {
    let started = Instant::now();
    let items_in = accepted.len();
    let max_themes = ctx.config().theme_range().max;
    let (validator, labeler) = (*validator, *labeler);
    let (themes, merges) = task::spawn_blocking(move || {
        refine_themes(accepted, &validator, &labeler, max_themes)
    })
    .await
    .map_err(|e| StageError::Failed(format!("refinement task failed: {}", e)))?;
    let dropped = items_in.saturating_sub(merges + themes.len());

    let live = details([
        ("themes", themes.len() as f64),
        ("merged", merges as f64),
        ("dropped_over_limit", dropped as f64),
        ("mean_coherence", mean_coherence(&themes) as f64),
    ]);
    ctx.emit(
        Stage::Refinement,
        1.0,
        format!("Refined to {} themes ({} merged)", themes.len(), merges),
        live.clone(),
    );
    ctx.record(stats(Stage::Refinement, 0, started, items_in, themes.len(), live));
    Ok(themes)
}

// ===== Provenance assembly =====

/// Per-source support of a theme.
pub fn provenance_for(theme: &CandidateTheme) -> ThemeProvenance {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for code in &theme.codes {
        *counts.entry(code.source_id.as_str()).or_insert(0) += 1;
    }
    let total = theme.codes.len().max(1) as f32;
    let mut contributions: Vec<SourceContribution> = counts
        .into_iter()
        .map(|(source_id, code_count)| SourceContribution {
            source_id: source_id.to_string(),
            code_count,
            influence: code_count as f32 / total,
        })
        .collect();
    contributions.sort_by(|a, b| {
        b.code_count
            .cmp(&a.code_count)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    ThemeProvenance {
        source_count: contributions.len(),
        dominant_influence: contributions.first().map_or(0.0, |c| c.influence),
        contributions,
    }
}

/// `COHERENCE_WEIGHT * mean coherence + (1 - COHERENCE_WEIGHT) * coverage`,
/// where coverage is the share of processed sources supporting any theme.
pub fn quality_score(themes: &[CandidateTheme], processed_sources: usize) -> f32 {
    if themes.is_empty() || processed_sources == 0 {
        return 0.0;
    }
    let covered: HashSet<&str> = themes
        .iter()
        .flat_map(|t| t.source_ids.iter().map(String::as_str))
        .collect();
    let coverage = (covered.len() as f32 / processed_sources as f32).min(1.0);
    (COHERENCE_WEIGHT * mean_coherence(themes) + (1.0 - COHERENCE_WEIGHT) * coverage)
        .clamp(0.0, 1.0)
}

/// Attach provenance, assign final ids and compute the quality score.
pub fn assemble(mut themes: Vec<CandidateTheme>, processed_sources: usize) -> (Vec<CandidateTheme>, f32) {
    for (i, theme) in themes.iter_mut().enumerate() {
        theme.id = format!("theme-{}", i + 1);
        theme.refresh_source_ids();
        theme.provenance = Some(provenance_for(theme));
    }
    let quality = quality_score(&themes, processed_sources);
    (themes, quality)
}

pub(crate) async fn provenance_assembly(
    ctx: &mut RunContext,
    themes: Vec<CandidateTheme>,
    processed_sources: usize,
) -> StageResult<(Vec<CandidateTheme>, f32)> {
    let started = Instant::now();
    let items_in = themes.len();
    let (themes, quality) = task::spawn_blocking(move || assemble(themes, processed_sources))
        .await
        .map_err(|e| StageError::Failed(format!("provenance task failed: {}", e)))?;
    let supporting: HashSet<&str> = themes
        .iter()
        .flat_map(|t| t.source_ids.iter().map(String::as_str))
        .collect();

    let live = details([
        ("themes", themes.len() as f64),
        ("quality_score", quality as f64),
        ("supporting_sources", supporting.len() as f64),
        ("processed_sources", processed_sources as f64),
    ]);
    ctx.emit(
        Stage::ProvenanceAssembly,
        1.0,
        format!("Assembled {} themes (quality {:.2})", themes.len(), quality),
        live.clone(),
    );
    ctx.record(stats(
        Stage::ProvenanceAssembly,
        0,
        started,
        items_in,
        themes.len(),
        live,
    ));
    Ok((themes, quality))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentKind;

    fn source(id: &str, text: &str) -> SourceContent {
        SourceContent::new(id, text, ContentKind::Abstract)
    }

    fn code(id: &str, source_id: &str, vector: Vec<f32>) -> InitialCode {
        InitialCode::new(id, format!("label {}", id), format!("about {}", id), source_id)
            .with_embedding(Embedding::new(vector))
    }

    fn theme(id: &str, codes: Vec<InitialCode>, coherence: f32) -> CandidateTheme {
        let centroid = code_centroid(&codes);
        let mut theme = new_theme(id.to_string(), codes, centroid);
        theme.coherence_score = coherence;
        theme
    }

    // ===== Source Preparation Tests =====

    #[test]
    fn test_prepare_sources_dedupes_and_caps() {
        let sources = vec![
            source("a", "Teacher burnout in rural schools"),
            source("b", "   "),
            source("a", "Another text with the same id"),
            source("c", "teacher   BURNOUT in rural schools"),
            source("d", "Mentoring programs"),
            source("e", "Funding gaps"),
        ];
        let (kept, counts) = prepare_sources(sources, Some(2));
        let ids: Vec<&str> = kept.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(counts.received, 6);
        assert_eq!(counts.empty, 1);
        assert_eq!(counts.duplicate_ids, 1);
        assert_eq!(counts.duplicate_texts, 1);
        assert_eq!(counts.capped, 1);
    }

    #[test]
    fn test_corpus_diversity() {
        let x = [1.0f32, 0.0];
        let y = [0.0f32, 1.0];
        let same: Vec<&[f32]> = vec![&x[..], &x[..]];
        assert!(corpus_diversity(&same).abs() < 1e-6);
        let apart: Vec<&[f32]> = vec![&x[..], &y[..]];
        assert!(corpus_diversity(&apart) > 0.2);
        assert_eq!(corpus_diversity(&[]), 0.0);
    }

    // ===== Refinement Tests =====

    #[test]
    fn test_refine_merges_near_duplicates() {
        let validator = CoherenceValidator::new(0.4);
        let labeler = LocalLabeler::new();
        let a = theme(
            "t1",
            vec![code("c1", "s1", vec![1.0, 0.0, 0.0]), code("c2", "s2", vec![1.0, 0.05, 0.0])],
            0.9,
        );
        let b = theme(
            "t2",
            vec![code("c3", "s3", vec![1.0, 0.0, 0.05]), code("c4", "s3", vec![0.98, 0.02, 0.0])],
            0.95,
        );
        let c = theme(
            "t3",
            vec![code("c5", "s4", vec![0.0, 0.0, 1.0]), code("c6", "s5", vec![0.0, 0.1, 1.0])],
            0.8,
        );

        let (themes, merges) = refine_themes(vec![a, b, c], &validator, &labeler, 10);
        assert_eq!(merges, 1);
        assert_eq!(themes.len(), 2);
        // The more coherent theme hosts the merge
        assert_eq!(themes[0].id, "t2");
        assert_eq!(themes[0].size(), 4);
        assert_eq!(themes[0].source_ids, vec!["s1", "s2", "s3"]);
        assert!(!themes[0].label.is_empty());
        assert!(themes[0].coherence_score >= themes[1].coherence_score);
    }

    #[test]
    fn test_refine_caps_keeping_most_coherent() {
        let validator = CoherenceValidator::new(0.0);
        let labeler = LocalLabeler::new();
        let themes: Vec<CandidateTheme> = (0..4)
            .map(|i| {
                let mut v = vec![0.0f32; 4];
                v[i] = 1.0;
                theme(&format!("t{}", i), vec![code(&format!("c{}", i), "s", v)], 0.5 + i as f32 / 10.0)
            })
            .collect();
        let (kept, merges) = refine_themes(themes, &validator, &labeler, 2);
        assert_eq!(merges, 0);
        let ids: Vec<&str> = kept.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2"]);
    }

    // ===== Provenance Tests =====

    #[test]
    fn test_provenance_and_quality() {
        let t = theme(
            "x",
            vec![
                code("c1", "s1", vec![1.0, 0.0]),
                code("c2", "s1", vec![1.0, 0.1]),
                code("c3", "s2", vec![0.9, 0.0]),
                code("c4", "s3", vec![1.0, 0.0]),
            ],
            0.8,
        );
        let provenance = provenance_for(&t);
        assert_eq!(provenance.source_count, 3);
        assert_eq!(provenance.contributions[0].source_id, "s1");
        assert!((provenance.dominant_influence - 0.5).abs() < 1e-6);
        let total: f32 = provenance.contributions.iter().map(|c| c.influence).sum();
        assert!((total - 1.0).abs() < 1e-6);

        let (themes, quality) = assemble(vec![t], 6);
        assert_eq!(themes[0].id, "theme-1");
        assert!(themes[0].provenance.is_some());
        // 0.7 * 0.8 + 0.3 * (3 / 6)
        assert!((quality - 0.71).abs() < 1e-5);
        assert_eq!(quality_score(&[], 10), 0.0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_stage_error() {
        let result: StageResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StageError::TimedOut(Duration::from_millis(10))));
        assert!(StageError::TimedOut(Duration::from_millis(10))
            .to_string()
            .starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_zero_limit_never_starts_stage() {
        let started = std::sync::atomic::AtomicBool::new(false);
        let result: StageResult<()> = with_timeout(Duration::ZERO, async {
            started.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StageError::TimedOut(Duration::ZERO)));
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));
    }
}
