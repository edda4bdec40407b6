//! Extraction pipeline.
//!
//! Runs the six analysis stages in order over one corpus:
//!
//! 1. Familiarization: validate, dedupe and embed the sources
//! 2. Initial coding: extract codes per source and embed them
//! 3. Theme generation: cluster the codes of a growing source window
//! 4. Theme review: keep coherent themes, check saturation, maybe loop to 3
//! 5. Refinement: merge near-duplicate themes and cap the count
//! 6. Provenance assembly: per-source support and the quality score
//!
//! # Usage
//!
//! ```ignore
//! use theme_engine::pipeline::{EngineSettings, ThemeExtractionEngine, TracingProgressSink};
//!
//! let engine = ThemeExtractionEngine::new(embedder, oracle, EngineSettings::default());
//! let result = engine
//!     .run(
//!         sources,
//!         ResearchPurpose::QualitativeAnalysis,
//!         &ConfigOverrides::default(),
//!         Arc::new(TracingProgressSink),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{} themes, quality {:.2}", result.theme_count(), result.quality_score);
//! ```
//!
//! Invalid configuration and cancellation are returned as errors and nothing
//! is persisted. A stage that times out or fails ends the run early with an
//! `Ok` result whose status is `RunStatus::Failed`, carrying the themes
//! accepted so far.

pub mod context;
pub mod progress;
pub mod saturation;
pub mod stages;
pub mod state;

pub use context::{RunContext, StageTimeouts};
pub use progress::{
    ChannelProgressSink, NoopProgressSink, ProgressEvent, ProgressSink, TracingProgressSink,
};
pub use saturation::{SaturationCheck, SaturationReason, SaturationTracker};
pub use state::{Stage, StageMachine, TransitionError, TOTAL_STAGES};

use crate::clustering::{ClusteringEngine, ClusteringSettings};
use crate::coherence::CoherenceValidator;
use crate::config::{resolve, ConfigOverrides, ResearchPurpose, ResolvedConfig, ValidationError};
use crate::embedding::cache::EmbeddingCache;
use crate::embedding::service::{EmbeddingService, EmbeddingSettings};
use crate::embedding::EmbeddingProvider;
use crate::extraction::guarded::{GuardedOracle, OracleSettings};
use crate::extraction::CodeExtractionOracle;
use crate::labeling::LocalLabeler;
use crate::models::{CandidateTheme, ExtractionResult, InitialCode, RunStatus, SourceContent};
use crate::provider::{ContentProvider, ProviderError};
use crate::storage::{ResultStore, StorageError};
use chrono::Utc;
use stages::StageError;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that end a run without a result.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration or overrides are invalid; no work was started
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    /// The run was cancelled
    #[error("Run cancelled")]
    Cancelled,

    /// The stage machine rejected a transition
    #[error("Stage transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Sources could not be fetched
    #[error("Content provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The result could not be persisted
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Nothing left to analyse after validation
    #[error("No usable sources: {0}")]
    NoUsableSources(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Runtime knobs for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub embedding: EmbeddingSettings,
    pub clustering: ClusteringSettings,

    /// Concurrency, retries, rate limit and circuit breaker of the oracle
    pub oracle: OracleSettings,

    pub timeouts: StageTimeouts,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            embedding: EmbeddingSettings::default(),
            clustering: ClusteringSettings::default(),
            oracle: OracleSettings::default(),
            timeouts: StageTimeouts::default(),
        }
    }
}

/// What stopped a run before completion.
enum Halt {
    Cancelled,
    Transition(TransitionError),
    Failed { stage: Stage, reason: String },
}

impl From<TransitionError> for Halt {
    fn from(err: TransitionError) -> Self {
        Halt::Transition(err)
    }
}

fn halt(stage: Stage) -> impl FnOnce(StageError) -> Halt {
    move |err| match err {
        StageError::Cancelled => Halt::Cancelled,
        other => Halt::Failed {
            stage,
            reason: other.to_string(),
        },
    }
}

/// Data carried between stages of one run.
#[derive(Default)]
struct RunState {
    sources: Vec<SourceContent>,
    codes: Vec<InitialCode>,
    themes: Vec<CandidateTheme>,
    quality_score: Option<f32>,
    processed_sources: usize,
    iterations: usize,
    saturation_reached: bool,
    low_confidence: bool,
}

/// Thematic analysis engine.
///
/// Owns the embedding service (and with it the embedding cache), the code
/// extraction oracle and the numeric components. One engine can serve many
/// runs; every run gets its own [`RunContext`].
pub struct ThemeExtractionEngine {
    embeddings: EmbeddingService,
    oracle: Arc<GuardedOracle>,
    clustering: ClusteringEngine,
    labeler: LocalLabeler,
    store: Option<Arc<dyn ResultStore>>,
    settings: EngineSettings,
}

impl ThemeExtractionEngine {
    /// Create an engine with a fresh embedding cache.
    ///
    /// # Arguments
    /// * `embedder` - Provider used for sources and codes
    /// * `oracle` - Code extraction oracle
    /// * `settings` - Concurrency, retry, clustering and timeout settings
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        oracle: Arc<dyn CodeExtractionOracle>,
        settings: EngineSettings,
    ) -> Self {
        let service = EmbeddingService::new(
            embedder,
            Arc::new(EmbeddingCache::new()),
            settings.embedding.clone(),
        );
        Self::from_service(service, oracle, settings)
    }

    /// Create an engine around an existing embedding service.
    pub fn from_service(
        embeddings: EmbeddingService,
        oracle: Arc<dyn CodeExtractionOracle>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            embeddings,
            oracle: Arc::new(GuardedOracle::new(oracle, &settings.oracle)),
            clustering: ClusteringEngine::new(settings.clustering.clone()),
            labeler: LocalLabeler::new(),
            store: None,
            settings,
        }
    }

    /// Switch to `fallback` when the primary embedding provider is isolated.
    pub fn with_fallback(mut self, fallback: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = self.embeddings.with_fallback(fallback);
        self
    }

    /// Persist every finished result to `store`.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn embeddings(&self) -> &EmbeddingService {
        &self.embeddings
    }

    /// Resolve the configuration and analyse `sources`.
    ///
    /// # Errors
    /// - `PipelineError::Validation` if the overrides are invalid; checked
    ///   before any other work
    /// - `PipelineError::Cancelled` if `cancel` fires
    /// - `PipelineError::NoUsableSources` if every source is empty or a duplicate
    /// - `PipelineError::Storage` if the result cannot be persisted
    pub async fn run(
        &self,
        sources: Vec<SourceContent>,
        purpose: ResearchPurpose,
        overrides: &ConfigOverrides,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> PipelineResult<ExtractionResult> {
        let config = resolve(purpose, overrides)?;
        self.run_resolved(config, sources, sink, cancel).await
    }

    /// Resolve the configuration, fetch sources from `provider` and analyse
    /// them. `source_ids` of `None` fetches everything.
    ///
    /// # Errors
    /// As [`ThemeExtractionEngine::run`], plus `PipelineError::Provider` if
    /// the sources cannot be fetched
    pub async fn run_from_provider(
        &self,
        provider: &dyn ContentProvider,
        source_ids: Option<&[String]>,
        purpose: ResearchPurpose,
        overrides: &ConfigOverrides,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> PipelineResult<ExtractionResult> {
        let config = resolve(purpose, overrides)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let sources = match source_ids {
            Some(ids) => provider.fetch(ids).await?,
            None => provider.fetch_all().await?,
        };
        info!(provider = provider.name(), count = sources.len(), "Fetched sources");
        self.run_resolved(config, sources, sink, cancel).await
    }

    /// Analyse `sources` with an already resolved configuration.
    pub async fn run_resolved(
        &self,
        config: ResolvedConfig,
        sources: Vec<SourceContent>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> PipelineResult<ExtractionResult> {
        config.validate()?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let (sources, prepared) = stages::prepare_sources(sources, config.max_sources);
        if sources.is_empty() {
            return Err(PipelineError::NoUsableSources(format!(
                "{} sources received, {} empty, {} duplicates",
                prepared.received,
                prepared.empty,
                prepared.duplicate_ids + prepared.duplicate_texts
            )));
        }

        let mut ctx = RunContext::new(config, sink, cancel, self.settings.timeouts);
        let mut tracker = SaturationTracker::new(
            ctx.config().saturation.clone(),
            ctx.config().theme_range().max,
        );
        let mut machine = StageMachine::new(tracker.iteration_ceiling());
        let mut state = RunState {
            sources,
            ..Default::default()
        };
        info!(
            run_id = %ctx.run_id(),
            purpose = %ctx.config().purpose,
            sources = state.sources.len(),
            "Starting extraction run"
        );

        let driven = self
            .drive(&mut ctx, &mut machine, &mut tracker, &mut state, prepared)
            .await;

        let status = match driven {
            Ok(()) => RunStatus::Complete,
            Err(Halt::Cancelled) => {
                machine.fail();
                warn!(run_id = %ctx.run_id(), "Extraction run cancelled");
                return Err(PipelineError::Cancelled);
            }
            Err(Halt::Transition(e)) => {
                machine.fail();
                error!(run_id = %ctx.run_id(), error = %e, "Stage machine rejected a transition");
                return Err(PipelineError::Transition(e));
            }
            Err(Halt::Failed { stage, reason }) => {
                machine.fail();
                error!(run_id = %ctx.run_id(), %stage, %reason, "Stage failed; returning partial result");
                RunStatus::Failed {
                    stage: stage.to_string(),
                    reason,
                }
            }
        };

        let (themes, quality_score) = match state.quality_score {
            Some(quality) => (std::mem::take(&mut state.themes), quality),
            None => stages::assemble(std::mem::take(&mut state.themes), state.processed_sources),
        };
        let result = ExtractionResult {
            run_id: ctx.run_id().to_string(),
            purpose: ctx.config().purpose,
            themes,
            quality_score,
            saturation_reached: state.saturation_reached,
            per_stage_stats: ctx.take_stats(),
            status,
            iterations: state.iterations,
            low_confidence: state.low_confidence,
            embedding_provider: self.embeddings.provider_label(),
            started_at: ctx.started_at(),
            finished_at: Utc::now(),
        };

        let mut summary = BTreeMap::new();
        summary.insert("themes".to_string(), result.theme_count() as f64);
        summary.insert("quality_score".to_string(), result.quality_score as f64);
        let description = if result.status.is_complete() {
            format!("Extraction complete: {} themes", result.theme_count())
        } else {
            format!("Extraction stopped early: {} themes", result.theme_count())
        };
        ctx.emit(Stage::Complete, 1.0, description, summary);
        info!(
            run_id = %result.run_id,
            themes = result.theme_count(),
            quality = result.quality_score,
            saturated = result.saturation_reached,
            iterations = result.iterations,
            "Extraction run finished"
        );

        if let Some(store) = &self.store {
            store.save(&result).await?;
        }
        Ok(result)
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        machine: &mut StageMachine,
        tracker: &mut SaturationTracker,
        state: &mut RunState,
        prepared: stages::PreparedCounts,
    ) -> Result<(), Halt> {
        let limit = ctx.timeout(Stage::Familiarization);
        stages::with_timeout(
            limit,
            stages::familiarize(ctx, &self.embeddings, &state.sources, prepared),
        )
        .await
        .map_err(halt(Stage::Familiarization))?;

        checkpoint(ctx)?;
        machine.advance(Stage::InitialCoding)?;
        let limit = ctx.timeout(Stage::InitialCoding);
        state.codes = stages::with_timeout(
            limit,
            stages::initial_coding(
                ctx,
                &self.oracle,
                &self.embeddings,
                &state.sources,
                self.settings.oracle.max_concurrency,
            ),
        )
        .await
        .map_err(halt(Stage::InitialCoding))?;

        let validator = CoherenceValidator::new(ctx.config().quality_threshold);
        let per_iteration = ctx.config().saturation.sources_per_iteration.max(1);
        loop {
            checkpoint(ctx)?;
            machine.advance(Stage::ThemeGeneration)?;
            let iteration = machine.iteration();
            let window_len = iteration
                .saturating_mul(per_iteration)
                .min(state.sources.len());
            let window: HashSet<String> = state.sources[..window_len]
                .iter()
                .map(|s| s.id.clone())
                .collect();

            let limit = ctx.timeout(Stage::ThemeGeneration);
            let generation = stages::with_timeout(
                limit,
                stages::generate_themes(
                    ctx,
                    &self.clustering,
                    &self.labeler,
                    &state.codes,
                    &window,
                    iteration,
                ),
            )
            .await
            .map_err(halt(Stage::ThemeGeneration))?;

            checkpoint(ctx)?;
            machine.advance(Stage::ThemeReview)?;
            let limit = ctx.timeout(Stage::ThemeReview);
            let (accepted, check) = stages::with_timeout(
                limit,
                stages::review_themes(ctx, &validator, tracker, generation.candidates, iteration),
            )
            .await
            .map_err(halt(Stage::ThemeReview))?;

            state.themes = accepted;
            state.low_confidence = generation.low_confidence;
            state.processed_sources = window_len;
            state.iterations = iteration;

            if let Some(reason) = check.reason {
                state.saturation_reached = matches!(
                    reason,
                    SaturationReason::NoNewThemes | SaturationReason::ThemeLimit
                );
                info!(iteration, ?reason, "Stopping theme iteration");
                break;
            }
            if window_len >= state.sources.len() {
                info!(iteration, "All sources processed before saturation");
                break;
            }
        }

        checkpoint(ctx)?;
        machine.advance(Stage::Refinement)?;
        let limit = ctx.timeout(Stage::Refinement);
        // Accepted themes stay in place until the stage succeeds
        state.themes = stages::with_timeout(
            limit,
            stages::refinement(ctx, &validator, &self.labeler, state.themes.clone()),
        )
        .await
        .map_err(halt(Stage::Refinement))?;

        checkpoint(ctx)?;
        machine.advance(Stage::ProvenanceAssembly)?;
        let limit = ctx.timeout(Stage::ProvenanceAssembly);
        let (themes, quality) = stages::with_timeout(
            limit,
            stages::provenance_assembly(ctx, state.themes.clone(), state.processed_sources),
        )
        .await
        .map_err(halt(Stage::ProvenanceAssembly))?;
        state.themes = themes;
        state.quality_score = Some(quality);

        machine.advance(Stage::Complete)?;
        Ok(())
    }
}

fn checkpoint(ctx: &RunContext) -> Result<(), Halt> {
    if ctx.is_cancelled() {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolve a purpose and overrides without running anything.
///
/// Thin wrapper kept next to the engine so callers can validate user input
/// up front with the same error type the engine returns.
pub fn resolve_config(
    purpose: ResearchPurpose,
    overrides: &ConfigOverrides,
) -> PipelineResult<ResolvedConfig> {
    Ok(resolve(purpose, overrides)?)
}
