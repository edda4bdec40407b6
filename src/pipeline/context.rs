//! Per-run context threaded through every stage.

use super::progress::{ProgressEvent, ProgressSink};
use super::state::Stage;
use crate::config::ResolvedConfig;
use crate::models::StageStats;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Wall-clock limit per stage.
///
/// Theme generation and review run once per iteration; their limit applies
/// to each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub familiarization: Duration,
    pub initial_coding: Duration,
    pub theme_generation: Duration,
    pub theme_review: Duration,
    pub refinement: Duration,
    pub provenance_assembly: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            familiarization: Duration::from_secs(600),
            initial_coding: Duration::from_secs(1800),
            theme_generation: Duration::from_secs(300),
            theme_review: Duration::from_secs(120),
            refinement: Duration::from_secs(120),
            provenance_assembly: Duration::from_secs(60),
        }
    }
}

impl StageTimeouts {
    /// The same limit for every stage.
    pub fn uniform(limit: Duration) -> Self {
        Self {
            familiarization: limit,
            initial_coding: limit,
            theme_generation: limit,
            theme_review: limit,
            refinement: limit,
            provenance_assembly: limit,
        }
    }

    pub fn get(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Familiarization => self.familiarization,
            Stage::InitialCoding => self.initial_coding,
            Stage::ThemeGeneration => self.theme_generation,
            Stage::ThemeReview => self.theme_review,
            Stage::Refinement => self.refinement,
            Stage::ProvenanceAssembly => self.provenance_assembly,
            Stage::Complete | Stage::Failed => Duration::ZERO,
        }
    }
}

/// State owned by one extraction run.
///
/// Holds everything a stage needs besides its inputs: the resolved
/// configuration, where progress goes, the cancellation token and the stats
/// collected so far. Nothing here is shared between runs.
pub struct RunContext {
    run_id: String,
    config: ResolvedConfig,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    timeouts: StageTimeouts,
    stats: Vec<StageStats>,
    started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        config: ResolvedConfig,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config,
            sink,
            cancel,
            timeouts,
            stats: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn timeout(&self, stage: Stage) -> Duration {
        self.timeouts.get(stage)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Send a progress event; never blocks.
    pub fn emit(
        &self,
        stage: Stage,
        fraction: f32,
        description: impl Into<String>,
        live_stats: BTreeMap<String, f64>,
    ) {
        self.sink
            .emit(ProgressEvent::new(stage, fraction, description).with_stats(live_stats));
    }

    pub fn record(&mut self, stats: StageStats) {
        self.stats.push(stats);
    }

    pub fn stats(&self) -> &[StageStats] {
        &self.stats
    }

    pub fn take_stats(&mut self) -> Vec<StageStats> {
        std::mem::take(&mut self.stats)
    }
}
