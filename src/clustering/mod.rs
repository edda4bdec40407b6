//! Adaptive k-means clustering of initial codes.
//!
//! # Algorithm
//!
//! 1. Codes without embeddings are set aside; the rest are ordered by id so
//!    that every later step sees the same sequence regardless of input order
//! 2. For every candidate `k`, centroids are seeded with k-means++ (D²
//!    weighting on cosine distance, from a per-`k` seeded RNG) and refined
//!    with Lloyd's iteration until assignments stop changing
//! 3. Several restarts run per `k`; the one with the lowest inertia wins
//! 4. Each `k` is scored by mean silhouette; the best score wins and ties go
//!    to the smaller `k`
//!
//! Cluster ids carry no meaning. Output clusters are ordered by their
//! smallest member id.

use crate::config::ThemeRange;
use crate::models::{Cluster, Embedding, InitialCode};
use crate::similarity::{calculate_centroid, cosine_similarity_optimized};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Silhouette scores closer than this are treated as equal.
pub const SILHOUETTE_TIE_EPSILON: f64 = 1e-9;

/// Cosine distance under which two embeddings count as identical.
const IDENTICAL_DISTANCE: f32 = 1e-6;

/// Errors raised by the clustering engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClusteringError {
    /// Nothing to cluster
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("Invalid k range {min}..={max}")]
    InvalidRange { min: usize, max: usize },

    /// Two codes carry embeddings of different dimensions
    #[error("Code '{code_id}' has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        code_id: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for clustering operations.
pub type ClusteringResult<T> = Result<T, ClusteringError>;

/// Tuning knobs for the clustering engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringSettings {
    /// Lloyd iterations per restart
    pub max_iterations: usize,

    /// Independent k-means++ restarts per candidate `k`
    pub restarts: usize,

    /// Base seed; the seed for each `k` and restart is derived from it
    pub seed: u64,

    /// Point count from which distance and assignment work runs on rayon
    pub parallel_threshold: usize,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            restarts: 4,
            seed: 0x5eed_7e3e,
            parallel_threshold: 256,
        }
    }
}

/// Score of one candidate `k`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KScore {
    pub k: usize,
    pub silhouette: f64,
    /// Sum of cosine distances to the assigned centroid
    pub inertia: f64,
}

/// Clusters plus the diagnostics of how they were chosen.
#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    pub clusters: Vec<Cluster>,
    pub selected_k: usize,

    /// Mean silhouette of the selected `k`; `None` when undefined
    pub silhouette: Option<f64>,

    pub k_scores: Vec<KScore>,

    /// Too few codes for the requested range; everything was collapsed
    pub low_confidence: bool,

    /// Ids of codes that had no embedding
    pub skipped_unembedded: Vec<String>,
}

/// Adaptive k-means++ clustering engine.
#[derive(Debug, Clone, Default)]
pub struct ClusteringEngine {
    settings: ClusteringSettings,
}

impl ClusteringEngine {
    pub fn new(settings: ClusteringSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ClusteringSettings {
        &self.settings
    }

    /// Cluster codes, choosing `k` within `k_range` by silhouette.
    ///
    /// # Arguments
    /// * `codes` - Codes to cluster; codes without embeddings are skipped
    /// * `k_range` - Allowed cluster counts
    ///
    /// # Returns
    /// The clusters and selection diagnostics. When there are fewer codes
    /// than `k_range.min` (or fewer than three), all codes collapse into one
    /// cluster flagged `low_confidence`. When every embedding is identical a
    /// single cluster is returned with an undefined silhouette.
    ///
    /// # Errors
    /// - `ClusteringError::DegenerateInput` if no code has an embedding
    /// - `ClusteringError::InvalidRange` if `k_range` is empty or starts at zero
    /// - `ClusteringError::DimensionMismatch` if embeddings disagree in dimension
    pub fn cluster(
        &self,
        codes: Vec<InitialCode>,
        k_range: ThemeRange,
    ) -> ClusteringResult<ClusteringOutcome> {
        if k_range.min == 0 || k_range.min > k_range.max {
            return Err(ClusteringError::InvalidRange {
                min: k_range.min,
                max: k_range.max,
            });
        }

        let (mut embedded, skipped): (Vec<InitialCode>, Vec<InitialCode>) =
            codes.into_iter().partition(|c| c.embedding.is_some());
        let mut skipped_unembedded: Vec<String> = skipped.into_iter().map(|c| c.id).collect();
        skipped_unembedded.sort();
        embedded.sort_by(|a, b| a.id.cmp(&b.id));

        let n = embedded.len();
        if n == 0 {
            return Err(ClusteringError::DegenerateInput(
                "no embedded codes to cluster".to_string(),
            ));
        }

        let points: Vec<&Embedding> = embedded
            .iter()
            .filter_map(|c| c.embedding.as_ref())
            .collect();
        let dimension = points[0].dimension();
        for code in &embedded {
            if let Some(embedding) = &code.embedding {
                if embedding.dimension() != dimension {
                    return Err(ClusteringError::DimensionMismatch {
                        code_id: code.id.clone(),
                        expected: dimension,
                        actual: embedding.dimension(),
                    });
                }
            }
        }

        if n < k_range.min || n < 3 {
            info!(
                n,
                min_k = k_range.min,
                "Too few codes for the requested range; collapsing to one low-confidence cluster"
            );
            return Ok(single_cluster(embedded, skipped_unembedded, true));
        }
        if all_identical(&points) {
            debug!(n, "All embeddings identical; returning a single cluster");
            return Ok(single_cluster(embedded, skipped_unembedded, false));
        }

        // One cluster per code is never a candidate
        let lo = k_range.min.max(2);
        let hi = k_range.max.min(n - 1);
        if lo > hi {
            return Ok(single_cluster(embedded, skipped_unembedded, false));
        }

        let parallel = n >= self.settings.parallel_threshold;
        let distances = DistanceMatrix::build(&points, parallel);

        let mut k_scores = Vec::with_capacity(hi - lo + 1);
        let mut best: Option<(KScore, Vec<usize>)> = None;
        for k in lo..=hi {
            let (assignments, inertia) = self.best_of_restarts(&points, k, parallel);
            let silhouette = distances.mean_silhouette(&assignments, k);
            let score = KScore {
                k,
                silhouette,
                inertia,
            };
            debug!(k, silhouette, inertia, "Scored candidate k");
            k_scores.push(score);

            let better = match &best {
                None => true,
                Some((current, _)) => silhouette > current.silhouette + SILHOUETTE_TIE_EPSILON,
            };
            if better {
                best = Some((score, assignments));
            }
        }

        let Some((chosen, assignments)) = best else {
            return Ok(single_cluster(embedded, skipped_unembedded, true));
        };

        let clusters = build_clusters(embedded, &assignments, chosen.k);
        info!(
            n,
            selected_k = clusters.len(),
            silhouette = chosen.silhouette,
            "Clustering complete"
        );
        Ok(ClusteringOutcome {
            selected_k: clusters.len(),
            clusters,
            silhouette: Some(chosen.silhouette),
            k_scores,
            low_confidence: false,
            skipped_unembedded,
        })
    }

    fn seed_for(&self, k: usize, restart: usize) -> u64 {
        self.settings
            .seed
            .wrapping_add((k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(restart as u64)
    }

    /// Run all restarts for one `k`, keeping the lowest inertia.
    fn best_of_restarts(&self, points: &[&Embedding], k: usize, parallel: bool) -> (Vec<usize>, f64) {
        let mut best: Option<(Vec<usize>, f64)> = None;
        for restart in 0..self.settings.restarts.max(1) {
            let mut rng = StdRng::seed_from_u64(self.seed_for(k, restart));
            let seeds = kmeans_plus_plus(points, k, &mut rng);
            let (assignments, inertia) =
                lloyd(points, seeds, self.settings.max_iterations, parallel);
            if best.as_ref().map_or(true, |(_, b)| inertia < *b) {
                best = Some((assignments, inertia));
            }
        }
        best.unwrap_or_else(|| (vec![0; points.len()], 0.0))
    }
}

fn distance(a: &Embedding, b: &Embedding) -> f32 {
    1.0 - cosine_similarity_optimized(a, b)
}

fn distance_to(point: &Embedding, centroid: &Embedding) -> f32 {
    distance(point, centroid)
}

fn all_identical(points: &[&Embedding]) -> bool {
    let first = points[0];
    points.iter().all(|p| p.vector() == first.vector() || distance(p, first) <= IDENTICAL_DISTANCE)
}

fn single_cluster(
    codes: Vec<InitialCode>,
    skipped_unembedded: Vec<String>,
    low_confidence: bool,
) -> ClusteringOutcome {
    let vectors: Vec<&[f32]> = codes
        .iter()
        .filter_map(|c| c.embedding.as_ref().map(Embedding::vector))
        .collect();
    let centroid = calculate_centroid(&vectors);
    ClusteringOutcome {
        clusters: vec![Cluster { codes, centroid }],
        selected_k: 1,
        silhouette: None,
        k_scores: Vec::new(),
        low_confidence,
        skipped_unembedded,
    }
}

/// k-means++ seeding: the first centroid uniformly at random, each next one
/// with probability proportional to the squared distance to its nearest
/// chosen centroid.
fn kmeans_plus_plus(points: &[&Embedding], k: usize, rng: &mut StdRng) -> Vec<Embedding> {
    let n = points.len();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    chosen.push(rng.gen_range(0..n));
    let mut nearest: Vec<f64> = vec![f64::MAX; n];

    while chosen.len() < k {
        let last = points[chosen[chosen.len() - 1]];
        for (i, point) in points.iter().enumerate() {
            let d = distance(point, last).max(0.0) as f64;
            nearest[i] = nearest[i].min(d * d);
        }

        let total: f64 = nearest.iter().sum();
        let next = if total <= 0.0 || !total.is_finite() {
            // Every point sits on a centroid; take the first unused index
            (0..n).find(|i| !chosen.contains(i))
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut pick = None;
            for (i, weight) in nearest.iter().enumerate() {
                if *weight <= 0.0 {
                    continue;
                }
                pick = Some(i);
                if target < *weight {
                    break;
                }
                target -= weight;
            }
            pick
        };
        match next {
            Some(index) => chosen.push(index),
            None => break,
        }
    }

    chosen.into_iter().map(|i| points[i].clone()).collect()
}

fn nearest_centroid(point: &Embedding, centroids: &[Embedding]) -> (usize, f32) {
    let mut best = (0, f32::MAX);
    for (j, centroid) in centroids.iter().enumerate() {
        let d = distance_to(point, centroid);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// Lloyd's iteration from the given seeds. Returns assignments and inertia.
fn lloyd(
    points: &[&Embedding],
    mut centroids: Vec<Embedding>,
    max_iterations: usize,
    parallel: bool,
) -> (Vec<usize>, f64) {
    let n = points.len();
    let k = centroids.len();
    let mut assignments: Vec<usize> = vec![usize::MAX; n];

    for _ in 0..max_iterations.max(1) {
        let nearest: Vec<(usize, f32)> = if parallel {
            points
                .par_iter()
                .map(|p| nearest_centroid(p, &centroids))
                .collect()
        } else {
            points.iter().map(|p| nearest_centroid(p, &centroids)).collect()
        };
        let mut next: Vec<usize> = nearest.iter().map(|(j, _)| *j).collect();

        // Reseed empty clusters with the point farthest from its centroid
        let mut counts = vec![0usize; k];
        for &j in &next {
            counts[j] += 1;
        }
        let mut taken = vec![false; n];
        let empties: Vec<usize> = (0..k).filter(|&j| counts[j] == 0).collect();
        for empty in empties {
            let farthest = (0..n)
                .filter(|&i| !taken[i] && counts[next[i]] > 1)
                .fold(None, |acc: Option<(usize, f32)>, i| {
                    let d = nearest[i].1;
                    match acc {
                        Some((_, best)) if best >= d => acc,
                        _ => Some((i, d)),
                    }
                });
            if let Some((i, _)) = farthest {
                counts[next[i]] -= 1;
                next[i] = empty;
                counts[empty] += 1;
                taken[i] = true;
            }
        }

        let stable = next == assignments;
        assignments = next;
        centroids = (0..k)
            .map(|j| {
                let members: Vec<&[f32]> = points
                    .iter()
                    .zip(&assignments)
                    .filter(|(_, &a)| a == j)
                    .map(|(p, _)| p.vector())
                    .collect();
                if members.is_empty() {
                    centroids[j].clone()
                } else {
                    Embedding::new(calculate_centroid(&members))
                }
            })
            .collect();
        if stable {
            break;
        }
    }

    let inertia = points
        .iter()
        .zip(&assignments)
        .map(|(p, &j)| distance_to(p, &centroids[j]).max(0.0) as f64)
        .sum();
    (assignments, inertia)
}

/// Dense symmetric cosine-distance matrix.
struct DistanceMatrix {
    n: usize,
    values: Vec<f32>,
}

impl DistanceMatrix {
    fn build(points: &[&Embedding], parallel: bool) -> Self {
        let n = points.len();
        let row = |i: usize| -> Vec<f32> {
            (0..n)
                .map(|j| if i == j { 0.0 } else { distance(points[i], points[j]).max(0.0) })
                .collect()
        };
        let rows: Vec<Vec<f32>> = if parallel {
            (0..n).into_par_iter().map(row).collect()
        } else {
            (0..n).map(row).collect()
        };
        Self {
            n,
            values: rows.into_iter().flatten().collect(),
        }
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j] as f64
    }

    /// Mean silhouette coefficient; singleton members score zero.
    fn mean_silhouette(&self, assignments: &[usize], k: usize) -> f64 {
        let n = self.n;
        let mut sizes = vec![0usize; k];
        for &a in assignments {
            sizes[a] += 1;
        }
        let total: f64 = (0..n)
            .map(|i| {
                let own = assignments[i];
                if sizes[own] <= 1 {
                    return 0.0;
                }
                let mut sums = vec![0.0f64; k];
                for j in 0..n {
                    if i != j {
                        sums[assignments[j]] += self.get(i, j);
                    }
                }
                let a = sums[own] / (sizes[own] - 1) as f64;
                let b = (0..k)
                    .filter(|&c| c != own && sizes[c] > 0)
                    .map(|c| sums[c] / sizes[c] as f64)
                    .fold(f64::INFINITY, f64::min);
                if !b.is_finite() {
                    return 0.0;
                }
                let max_ab = a.max(b);
                if max_ab < f64::EPSILON {
                    0.0
                } else {
                    (b - a) / max_ab
                }
            })
            .sum();
        total / n as f64
    }
}

/// Group codes by assignment, dropping empty clusters, ordered by the
/// smallest member id. `codes` must already be sorted by id.
fn build_clusters(codes: Vec<InitialCode>, assignments: &[usize], k: usize) -> Vec<Cluster> {
    let mut groups: Vec<Vec<InitialCode>> = (0..k).map(|_| Vec::new()).collect();
    for (code, &a) in codes.into_iter().zip(assignments) {
        groups[a].push(code);
    }
    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|codes| {
            let vectors: Vec<&[f32]> = codes
                .iter()
                .filter_map(|c| c.embedding.as_ref().map(Embedding::vector))
                .collect();
            let centroid = calculate_centroid(&vectors);
            Cluster { codes, centroid }
        })
        .collect();
    clusters.sort_by(|a, b| a.codes[0].id.cmp(&b.codes[0].id));
    clusters
}
