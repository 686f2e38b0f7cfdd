// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cosine similarity between embedding vectors.
//!
//! Mismatched vector lengths happen in practice (stale cache entries,
//! model migrations), so this module degrades gracefully instead of
//! failing: vectors of different lengths are truncated to the shorter
//! one before comparison, and any unusable input yields 0.0. A bad
//! vector must never abort retrieval for the whole batch.

use tracing::debug;

/// Computes cosine similarity in `[-1, 1]`.
///
/// Returns 0.0 (minimum similarity) for empty vectors, zero norms, or a
/// non-finite result. Vectors of unequal length are compared over their
/// common prefix.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    if a.len() != b.len() {
        debug!(
            left = a.len(),
            right = b.len(),
            "Vector length mismatch; truncating to the shorter length"
        );
    }

    let a = &a[..len];
    let b = &b[..len];

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product / (magnitude_a * magnitude_b);
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine(&a, &a) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_orthogonal_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_opposite_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine(&a, &b) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_mismatched_lengths_truncate() {
        // [1,2,3] vs [1,2] must equal [1,2] vs [1,2]
        let long = vec![1.0, 2.0, 3.0];
        let short = vec![1.0, 2.0];
        let truncated = cosine(&long, &short);
        let reference = cosine(&short, &short);
        assert!((truncated - reference).abs() < 0.0001);
        assert!((reference - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_zero_norm_returns_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let a = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine(&zero, &a), 0.0);
        assert_eq!(cosine(&a, &zero), 0.0);
    }

    #[test]
    fn test_empty_vectors() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[]), 0.0);
    }
}
