//! Property tests for the codecs.

use proptest::prelude::*;
use sona_core::quantization::{
    dequantize, quantize_asymmetric, quantize_symmetric, quantized_cosine_distance,
};

fn normalized_vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, dim).prop_filter_map("zero vector", |v| {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < 1e-3 {
            None
        } else {
            Some(v.into_iter().map(|x| x / norm).collect())
        }
    })
}

proptest! {
    #[test]
    fn symmetric_roundtrip_keeps_cosine_similarity(v in normalized_vector(64)) {
        let q = quantize_symmetric(&v);
        let restored = dequantize(&q);

        let dot: f32 = v.iter().zip(&restored).map(|(a, b)| a * b).sum();
        let norm: f32 = restored.iter().map(|x| x * x).sum::<f32>().sqrt();
        prop_assert!(norm > 0.0);
        prop_assert!(dot / norm > 0.999);
    }

    #[test]
    fn asymmetric_error_is_bounded_by_one_step(v in prop::collection::vec(-10.0f32..10.0, 32)) {
        let q = quantize_asymmetric(&v);
        let restored = dequantize(&q);
        for (orig, rec) in v.iter().zip(&restored) {
            prop_assert!((orig - rec).abs() <= q.scale * 0.51 + 1e-5);
        }
    }

    #[test]
    fn requantization_is_stable(v in normalized_vector(48)) {
        let q1 = quantize_symmetric(&v);
        let q2 = quantize_symmetric(&dequantize(&q1));
        for (a, b) in q1.data.iter().zip(&q2.data) {
            prop_assert!((i16::from(*a) - i16::from(*b)).abs() <= 1);
        }
    }

    #[test]
    fn quantized_distance_stays_in_range(
        a in normalized_vector(32),
        b in normalized_vector(32),
    ) {
        let d = quantized_cosine_distance(&quantize_symmetric(&a), &quantize_symmetric(&b));
        prop_assert!((0.0..=2.0).contains(&d));
    }

    #[test]
    fn cosine_distance_symmetry(
        a in normalized_vector(32),
        b in normalized_vector(32),
    ) {
        let d_ab = sona_core::distance::cosine_distance(&a, &b);
        let d_ba = sona_core::distance::cosine_distance(&b, &a);
        prop_assert!((d_ab - d_ba).abs() < 1e-6);
        prop_assert!((0.0..=2.0).contains(&d_ab));
    }
}
