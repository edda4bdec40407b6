//! Saturation stopping rule.
//!
//! After every review pass the accepted themes are compared with the themes
//! accepted by the previous pass. A theme is new when its centroid is less
//! similar than the novelty threshold to every earlier theme. Iteration stops
//! when a pass after the first yields fewer new themes than the policy asks
//! for, when the accepted count reaches the range maximum, or when the
//! iteration ceiling is hit.

use crate::config::{SaturationPolicy, HARD_ITERATION_CEILING};
use crate::models::CandidateTheme;
use crate::similarity::checked_cosine_similarity;
use serde::{Deserialize, Serialize};

/// Why iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationReason {
    /// The last pass produced too few new themes
    NoNewThemes,
    /// The accepted count reached the target maximum
    ThemeLimit,
    /// The iteration ceiling was hit
    IterationCeiling,
}

/// Result of observing one review pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SaturationCheck {
    pub iteration: usize,
    pub new_themes: usize,
    pub accepted: usize,
    pub reason: Option<SaturationReason>,
}

impl SaturationCheck {
    pub fn saturated(&self) -> bool {
        self.reason.is_some()
    }
}

/// Tracks accepted themes across iterations.
#[derive(Debug, Clone)]
pub struct SaturationTracker {
    policy: SaturationPolicy,
    max_themes: usize,
    iteration: usize,
    known: Vec<Vec<f32>>,
    yields: Vec<usize>,
}

impl SaturationTracker {
    pub fn new(policy: SaturationPolicy, max_themes: usize) -> Self {
        Self {
            policy,
            max_themes,
            iteration: 0,
            known: Vec::new(),
            yields: Vec::new(),
        }
    }

    /// Iterations allowed before the ceiling stops the loop.
    pub fn iteration_ceiling(&self) -> usize {
        self.policy.max_iterations.clamp(1, HARD_ITERATION_CEILING)
    }

    /// New themes found by each observed pass, in order.
    pub fn yields(&self) -> &[usize] {
        &self.yields
    }

    /// Number of `accepted` themes that are unlike every known theme.
    pub fn count_novel(&self, accepted: &[CandidateTheme]) -> usize {
        accepted
            .iter()
            .filter(|theme| self.is_novel(&theme.centroid))
            .count()
    }

    fn is_novel(&self, centroid: &[f32]) -> bool {
        self.known.iter().all(|known| {
            // Incomparable centroids cannot be told apart from new material
            checked_cosine_similarity(known, centroid)
                .map_or(true, |similarity| similarity < self.policy.novelty_threshold)
        })
    }

    /// Record the themes accepted by one review pass.
    ///
    /// Accepted themes of later passes include the material of earlier
    /// ones, so each pass replaces the known set.
    pub fn observe(&mut self, accepted: &[CandidateTheme]) -> SaturationCheck {
        self.iteration += 1;
        let new_themes = self.count_novel(accepted);
        self.yields.push(new_themes);
        self.known = accepted.iter().map(|t| t.centroid.clone()).collect();

        let reason = if self.iteration > 1 && new_themes < self.policy.min_new_themes {
            Some(SaturationReason::NoNewThemes)
        } else if accepted.len() >= self.max_themes {
            Some(SaturationReason::ThemeLimit)
        } else if self.iteration >= self.iteration_ceiling() {
            Some(SaturationReason::IterationCeiling)
        } else {
            None
        };

        SaturationCheck {
            iteration: self.iteration,
            new_themes,
            accepted: accepted.len(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min_new_themes: usize, max_iterations: usize) -> SaturationPolicy {
        SaturationPolicy {
            sources_per_iteration: 10,
            min_new_themes,
            max_iterations,
            novelty_threshold: 0.8,
        }
    }

    fn theme(id: &str, centroid: Vec<f32>) -> CandidateTheme {
        CandidateTheme {
            id: id.to_string(),
            label: id.to_string(),
            description: String::new(),
            keywords: Vec::new(),
            definition: String::new(),
            codes: Vec::new(),
            centroid,
            source_ids: Vec::new(),
            coherence_score: 0.8,
            low_confidence: false,
            provenance: None,
        }
    }

    #[test]
    fn test_first_pass_never_saturates_on_yield() {
        let mut tracker = SaturationTracker::new(policy(1, 10), 20);
        let check = tracker.observe(&[]);
        assert_eq!(check.new_themes, 0);
        assert!(!check.saturated());
    }

    #[test]
    fn test_no_new_themes_saturates() {
        let mut tracker = SaturationTracker::new(policy(1, 10), 20);
        let first = vec![theme("a", vec![1.0, 0.0]), theme("b", vec![0.0, 1.0])];
        assert_eq!(tracker.observe(&first).new_themes, 2);

        // Slightly moved centroids are the same themes
        let second = vec![theme("a", vec![0.95, 0.05]), theme("b", vec![0.05, 0.95])];
        let check = tracker.observe(&second);
        assert_eq!(check.new_themes, 0);
        assert_eq!(check.reason, Some(SaturationReason::NoNewThemes));
    }

    #[test]
    fn test_new_theme_keeps_iterating() {
        let mut tracker = SaturationTracker::new(policy(1, 10), 20);
        tracker.observe(&[theme("a", vec![1.0, 0.0, 0.0])]);
        let check = tracker.observe(&[
            theme("a", vec![1.0, 0.0, 0.0]),
            theme("c", vec![0.0, 0.0, 1.0]),
        ]);
        assert_eq!(check.new_themes, 1);
        assert!(!check.saturated());
        assert_eq!(tracker.yields(), &[1, 1]);
    }

    #[test]
    fn test_theme_limit_and_ceiling() {
        let mut tracker = SaturationTracker::new(policy(1, 10), 2);
        let check = tracker.observe(&[theme("a", vec![1.0, 0.0]), theme("b", vec![0.0, 1.0])]);
        assert_eq!(check.reason, Some(SaturationReason::ThemeLimit));

        let mut tracker = SaturationTracker::new(policy(1, 1), 20);
        assert_eq!(
            tracker.observe(&[theme("a", vec![1.0])]).reason,
            Some(SaturationReason::IterationCeiling)
        );
    }

    #[test]
    fn test_saturated_stays_saturated() {
        let mut tracker = SaturationTracker::new(policy(1, 50), 20);
        let themes = vec![
            theme("a", vec![1.0, 0.0, 0.0]),
            theme("b", vec![0.0, 1.0, 0.0]),
            theme("c", vec![0.0, 0.0, 1.0]),
        ];
        tracker.observe(&themes);
        assert!(tracker.observe(&themes).saturated());
        for _ in 0..5 {
            let check = tracker.observe(&themes);
            assert_eq!(check.new_themes, 0, "Re-running must not add themes");
            assert!(check.saturated());
        }
    }

    #[test]
    fn test_mismatched_centroid_counts_as_new() {
        let mut tracker = SaturationTracker::new(policy(1, 10), 20);
        tracker.observe(&[theme("a", vec![1.0, 0.0])]);
        assert_eq!(tracker.count_novel(&[theme("x", vec![1.0, 0.0, 0.0])]), 1);
    }
}
