//! Stage state machine.
//!
//! ```text
//! Familiarization -> InitialCoding -> ThemeGeneration -> ThemeReview
//!                                          ^                 |
//!                                          +---- loop -------+
//!                                                            v
//!                    Complete <- ProvenanceAssembly <- Refinement
//! ```
//!
//! `Failed` is reachable from every non-terminal stage. Loop-backs from
//! review to generation are counted and capped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of working stages reported in progress events.
pub const TOTAL_STAGES: usize = 6;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Familiarization,
    InitialCoding,
    ThemeGeneration,
    ThemeReview,
    Refinement,
    ProvenanceAssembly,
    Complete,
    Failed,
}

impl Stage {
    /// Working stages in execution order.
    pub const WORKING: [Stage; TOTAL_STAGES] = [
        Stage::Familiarization,
        Stage::InitialCoding,
        Stage::ThemeGeneration,
        Stage::ThemeReview,
        Stage::Refinement,
        Stage::ProvenanceAssembly,
    ];

    /// 1-based position among the working stages; terminal stages report
    /// `TOTAL_STAGES`.
    pub fn number(&self) -> usize {
        match self {
            Stage::Familiarization => 1,
            Stage::InitialCoding => 2,
            Stage::ThemeGeneration => 3,
            Stage::ThemeReview => 4,
            Stage::Refinement => 5,
            Stage::ProvenanceAssembly => 6,
            Stage::Complete | Stage::Failed => TOTAL_STAGES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Familiarization => "familiarization",
            Stage::InitialCoding => "initial_coding",
            Stage::ThemeGeneration => "theme_generation",
            Stage::ThemeReview => "theme_review",
            Stage::Refinement => "refinement",
            Stage::ProvenanceAssembly => "provenance_assembly",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Familiarization, InitialCoding)
                | (InitialCoding, ThemeGeneration)
                | (ThemeGeneration, ThemeReview)
                | (ThemeReview, ThemeGeneration)
                | (ThemeReview, Refinement)
                | (Refinement, ProvenanceAssembly)
                | (ProvenanceAssembly, Complete)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by [`StageMachine::advance`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal { from: Stage, to: Stage },

    /// The review loop ran more often than the iteration ceiling allows
    #[error("iteration ceiling of {limit} reached")]
    IterationCeiling { limit: usize },
}

/// Tracks the current stage and guards transitions.
#[derive(Debug, Clone)]
pub struct StageMachine {
    current: Stage,
    iteration: usize,
    max_iterations: usize,
    history: Vec<Stage>,
}

impl StageMachine {
    /// Start at familiarization, allowing at most `max_iterations` passes
    /// through theme generation.
    pub fn new(max_iterations: usize) -> Self {
        Self {
            current: Stage::Familiarization,
            iteration: 0,
            max_iterations: max_iterations.max(1),
            history: vec![Stage::Familiarization],
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    /// Number of theme generation passes started so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// - `TransitionError::Illegal` if `next` does not follow the current stage
    /// - `TransitionError::IterationCeiling` if entering theme generation
    ///   would exceed the iteration ceiling
    pub fn advance(&mut self, next: Stage) -> Result<(), TransitionError> {
        if !self.current.can_advance_to(next) {
            return Err(TransitionError::Illegal {
                from: self.current,
                to: next,
            });
        }
        if next == Stage::ThemeGeneration {
            if self.iteration >= self.max_iterations {
                return Err(TransitionError::IterationCeiling {
                    limit: self.max_iterations,
                });
            }
            self.iteration += 1;
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` from wherever the machine is.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            self.current = Stage::Failed;
            self.history.push(Stage::Failed);
        }
    }
}
