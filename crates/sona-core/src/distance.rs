//! Distance kernels for vector similarity calculations.
//!
//! All kernels are pure functions over equal-length `f32` slices. They hold
//! no shared state and are safe to call from any thread. Inner loops are
//! unrolled 8 wide with 4 accumulators for instruction-level parallelism.

use serde::{Deserialize, Serialize};

/// Distance metric for vector similarity calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine distance (`1 - dot`) over unit-normalized vectors.
    Cosine,
    /// Euclidean distance (L2 norm).
    Euclidean,
    /// Negative dot product, for "maximize similarity" semantics in min-heaps.
    Dot,
}

impl DistanceMetric {
    /// Computes the distance between two vectors using this metric.
    ///
    /// # Panics
    ///
    /// Panics if the slices have different lengths. Length agreement is the
    /// caller's responsibility; a mismatch is a programmer error.
    #[must_use]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_distance(a, b),
            Self::Euclidean => euclidean_distance(a, b),
            Self::Dot => negative_dot(a, b),
        }
    }

    /// Maps a distance produced by this metric back to a similarity score.
    ///
    /// Cosine: `1 - d`; Euclidean: `1 / (1 + d)`; Dot: `-d`.
    #[must_use]
    pub fn similarity_from_distance(&self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::Euclidean => 1.0 / (1.0 + distance),
            Self::Dot => -distance,
        }
    }
}

/// Dot product with an 8-wide unrolled loop and 4 accumulators.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let chunks = a.len() / 8;
    let mut sum0 = 0.0f32;
    let mut sum1 = 0.0f32;
    let mut sum2 = 0.0f32;
    let mut sum3 = 0.0f32;

    for i in 0..chunks {
        let base = i * 8;
        sum0 += a[base] * b[base] + a[base + 4] * b[base + 4];
        sum1 += a[base + 1] * b[base + 1] + a[base + 5] * b[base + 5];
        sum2 += a[base + 2] * b[base + 2] + a[base + 6] * b[base + 6];
        sum3 += a[base + 3] * b[base + 3] + a[base + 7] * b[base + 7];
    }

    let base = chunks * 8;
    for i in base..a.len() {
        sum0 += a[i] * b[i];
    }

    sum0 + sum1 + sum2 + sum3
}

/// Cosine distance `1 - dot(a, b)` assuming unit vectors, clamped to [0, 2].
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - dot(a, b)).clamp(0.0, 2.0)
}

/// Squared Euclidean distance, without the final square root.
#[inline]
#[must_use]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let chunks = a.len() / 8;
    let mut sum0 = 0.0f32;
    let mut sum1 = 0.0f32;
    let mut sum2 = 0.0f32;
    let mut sum3 = 0.0f32;

    for i in 0..chunks {
        let base = i * 8;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];
        let d4 = a[base + 4] - b[base + 4];
        let d5 = a[base + 5] - b[base + 5];
        let d6 = a[base + 6] - b[base + 6];
        let d7 = a[base + 7] - b[base + 7];

        sum0 += d0 * d0 + d4 * d4;
        sum1 += d1 * d1 + d5 * d5;
        sum2 += d2 * d2 + d6 * d6;
        sum3 += d3 * d3 + d7 * d7;
    }

    let base = chunks * 8;
    for i in base..a.len() {
        let d = a[i] - b[i];
        sum0 += d * d;
    }

    sum0 + sum1 + sum2 + sum3
}

/// Euclidean distance (L2 norm of the difference).
#[inline]
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Negative dot product `-dot(a, b)`.
///
/// Lower is more similar, which lets maximum-inner-product search reuse
/// min-heap machinery unchanged.
#[inline]
#[must_use]
pub fn negative_dot(a: &[f32], b: &[f32]) -> f32 {
    -dot(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(v: &mut [f32]) {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
    }

    #[test]
    fn cosine_self_distance_is_zero() {
        let mut v: Vec<f32> = (0..1536).map(|i| (i as f32).sin()).collect();
        normalize(&mut v);
        assert!(cosine_distance(&v, &v).abs() < 1e-5);
    }

    #[test]
    fn cosine_is_symmetric() {
        let mut a: Vec<f32> = (0..128).map(|i| (i as f32).cos()).collect();
        let mut b: Vec<f32> = (0..128).map(|i| (i as f32 * 0.3).sin()).collect();
        normalize(&mut a);
        normalize(&mut b);
        let d_ab = cosine_distance(&a, &b);
        let d_ba = cosine_distance(&b, &a);
        assert!((d_ab - d_ba).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_one() {
        let a = {
            let mut v = vec![0.0f32; 8];
            v[0] = 1.0;
            v
        };
        let b = {
            let mut v = vec![0.0f32; 8];
            v[1] = 1.0;
            v
        };
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_clamps_to_range() {
        // Anti-parallel unit vectors: raw 1 - dot = 2.0, must not exceed it.
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![-1.0f32, 0.0, 0.0];
        let d = cosine_distance(&a, &b);
        assert!((0.0..=2.0).contains(&d));
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn euclidean_three_four_five() {
        let a = vec![0.0f32, 0.0, 0.0];
        let b = vec![3.0f32, 4.0, 0.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
        assert!((squared_euclidean(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn unrolled_dot_matches_naive() {
        // Length 37 exercises both the unrolled body and the remainder tail.
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.1).collect();
        let b: Vec<f32> = (0..37).map(|i| (37 - i) as f32 * 0.05).collect();
        let naive: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot(&a, &b) - naive).abs() < 1e-4);
        assert!((negative_dot(&a, &b) + naive).abs() < 1e-4);
    }

    #[test]
    fn similarity_mappings() {
        assert!((DistanceMetric::Cosine.similarity_from_distance(0.25) - 0.75).abs() < 1e-6);
        assert!((DistanceMetric::Euclidean.similarity_from_distance(1.0) - 0.5).abs() < 1e-6);
        assert!((DistanceMetric::Dot.similarity_from_distance(-0.9) - 0.9).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "vector dimensions must match")]
    fn dimension_mismatch_is_fatal() {
        let _ = dot(&[1.0, 2.0], &[1.0]);
    }
}
