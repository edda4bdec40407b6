//! Similarity kernel.
//!
//! Vector math shared by clustering, coherence scoring and refinement:
//! cosine similarity (naive and norm-reusing), centroids and magnitudes.
//!
//! Both cosine variants compute `dot(a, b) / (|a| * |b|)`. The optimized
//! variant only skips recomputing the norms, which are stored on
//! [`Embedding`]. A zero norm yields a similarity of `0.0` instead of a
//! division by zero.

use crate::models::Embedding;

/// L2 norm of a vector.
pub fn magnitude(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn from_parts(dot_product: f32, norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot_product / (norm_a * norm_b);
    // NaN passes through so callers can detect it
    if score.is_nan() {
        score
    } else {
        score.clamp(-1.0, 1.0)
    }
}

/// Compute cosine similarity between two vectors.
///
/// # Arguments
/// * `a` - First vector
/// * `b` - Second vector
///
/// # Returns
/// The cosine similarity in `[-1, 1]`, or `0.0` when either vector has zero
/// magnitude
///
/// # Panics
/// Panics if the vectors have different lengths. Mixing dimensions within a
/// run is an invariant violation; use [`checked_cosine_similarity`] when the
/// inputs are not already known to agree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vectors must have the same length");
    from_parts(dot(a, b), magnitude(a), magnitude(b))
}

/// Cosine similarity that returns `None` on a dimension mismatch.
pub fn checked_cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(from_parts(dot(a, b), magnitude(a), magnitude(b)))
}

/// Cosine similarity between two embeddings, reusing their stored norms.
///
/// Produces the same value as [`cosine_similarity`] on the raw vectors.
///
/// # Panics
/// Panics if the embeddings have different dimensions.
pub fn cosine_similarity_optimized(a: &Embedding, b: &Embedding) -> f32 {
    assert_eq!(
        a.dimension(),
        b.dimension(),
        "Embeddings must have the same dimension"
    );
    from_parts(dot(a.vector(), b.vector()), a.norm(), b.norm())
}

/// Cosine distance, `1 - cosine_similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Elementwise mean of a set of vectors.
///
/// Returns an empty vector when `vectors` is empty.
///
/// # Panics
/// Panics if the vectors do not all share the same dimension.
pub fn calculate_centroid<V: AsRef<[f32]>>(vectors: &[V]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dimension = first.as_ref().len();
    let mut sum = vec![0.0f32; dimension];
    for vector in vectors {
        let vector = vector.as_ref();
        assert_eq!(vector.len(), dimension, "Vectors must have the same length");
        for (acc, value) in sum.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
    }
    let count = vectors.len() as f32;
    sum.iter_mut().for_each(|v| *v /= count);
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 0.0).abs() < 1e-6);

        let a = vec![1.0, 1.0];
        let b = vec![-1.0, -1.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_returns_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let other = vec![0.3, 0.1, 0.9];
        assert_eq!(cosine_similarity(&zero, &other), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_optimized_matches_naive() {
        let vectors = vec![
            vec![0.12, -0.4, 0.33, 0.9],
            vec![0.5, 0.5, -0.1, 0.2],
            vec![-0.7, 0.05, 0.6, -0.3],
            vec![0.0, 0.0, 0.0, 0.0],
        ];
        for a in &vectors {
            for b in &vectors {
                let naive = cosine_similarity(a, b);
                let fast = cosine_similarity_optimized(
                    &Embedding::new(a.clone()),
                    &Embedding::new(b.clone()),
                );
                assert!((naive - fast).abs() < 1e-6, "{} vs {}", naive, fast);
            }
        }
    }

    #[test]
    fn test_similarity_bounded() {
        let a = vec![1e-3, 2e-3, 3e-3];
        let score = cosine_similarity(&a, &a);
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn test_checked_similarity_mismatch() {
        assert!(checked_cosine_similarity(&[1.0, 0.0], &[1.0]).is_none());
        assert_eq!(checked_cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
    }

    #[test]
    fn test_centroid_and_magnitude() {
        let centroid = calculate_centroid(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(centroid, vec![2.0, 3.0]);
        assert!(calculate_centroid::<Vec<f32>>(&[]).is_empty());
        assert!((magnitude(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance() {
        assert!((cosine_distance(&[1.0, 0.0], &[1.0, 0.0])).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }
}
