//! INT8 scalar quantization for vector storage.
//!
//! Trades ~4x memory for a bounded precision loss during graph traversal;
//! final candidates are re-ranked against the float originals by the index.
//!
//! Two encodings are supported:
//!
//! - **Symmetric**: `s = max(|v|) / 127`, `zero_point = 0`. Preserves the
//!   sign structure, which lets cosine distance run as an integer dot
//!   product.
//! - **Asymmetric**: `s = (max - min) / 255`, `zero_point = min`. Tighter
//!   range utilization for skewed inputs at the cost of float-path
//!   distances.
//!
//! Quantization never fails: a zero range yields `s = 1` and decode
//! reconstructs the constant input exactly.

use crate::distance;
use serde::{Deserialize, Serialize};

/// Encoding scheme for a quantized vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    /// Sign-preserving, `zero_point == 0`.
    Symmetric,
    /// Range-shifting, `zero_point == min`.
    Asymmetric,
}

/// An INT8-encoded vector with its reconstruction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVector {
    /// Quantized values.
    pub data: Vec<i8>,
    /// Reconstruction scale.
    pub scale: f32,
    /// Reconstruction offset. Zero for symmetric encodings.
    pub zero_point: f32,
}

impl QuantizedVector {
    /// True when this vector uses the symmetric encoding.
    #[must_use]
    pub fn is_symmetric(&self) -> bool {
        self.zero_point == 0.0
    }

    /// Dimension of the encoded vector.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the encoded vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A batch of quantized vectors with parallel parameter arrays.
#[derive(Debug, Clone, Default)]
pub struct QuantizedBatch {
    /// Encoded vectors in input order.
    pub vectors: Vec<QuantizedVector>,
    /// `scale` of each vector, parallel to `vectors`.
    pub scales: Vec<f32>,
    /// `zero_point` of each vector, parallel to `vectors`.
    pub zero_points: Vec<f32>,
}

/// Quantizes a vector with the symmetric scheme.
#[must_use]
pub fn quantize_symmetric(vector: &[f32]) -> QuantizedVector {
    let max_abs = vector.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 127.0 };

    let data = vector
        .iter()
        .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
        .collect();

    QuantizedVector {
        data,
        scale,
        zero_point: 0.0,
    }
}

/// Quantizes a vector with the asymmetric scheme.
#[must_use]
pub fn quantize_asymmetric(vector: &[f32]) -> QuantizedVector {
    let (min, max) = vector.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    let (min, max) = if vector.is_empty() {
        (0.0, 0.0)
    } else {
        (min, max)
    };

    let range = max - min;
    let scale = if range == 0.0 { 1.0 } else { range / 255.0 };

    let data = vector
        .iter()
        .map(|&v| (((v - min) / scale).round() - 128.0).clamp(-128.0, 127.0) as i8)
        .collect();

    QuantizedVector {
        data,
        scale,
        zero_point: min,
    }
}

/// Quantizes a vector with the requested mode.
#[must_use]
pub fn quantize(vector: &[f32], mode: QuantizationMode) -> QuantizedVector {
    match mode {
        QuantizationMode::Symmetric => quantize_symmetric(vector),
        QuantizationMode::Asymmetric => quantize_asymmetric(vector),
    }
}

/// Reconstructs the float vector from its INT8 encoding.
#[must_use]
pub fn dequantize(quantized: &QuantizedVector) -> Vec<f32> {
    if quantized.is_symmetric() {
        quantized
            .data
            .iter()
            .map(|&q| f32::from(q) * quantized.scale)
            .collect()
    } else {
        quantized
            .data
            .iter()
            .map(|&q| (f32::from(q) + 128.0) * quantized.scale + quantized.zero_point)
            .collect()
    }
}

/// Quantizes a batch, returning parallel scale and zero-point arrays.
#[must_use]
pub fn quantize_batch(vectors: &[Vec<f32>], mode: QuantizationMode) -> QuantizedBatch {
    let mut batch = QuantizedBatch {
        vectors: Vec::with_capacity(vectors.len()),
        scales: Vec::with_capacity(vectors.len()),
        zero_points: Vec::with_capacity(vectors.len()),
    };

    for vector in vectors {
        let q = quantize(vector, mode);
        batch.scales.push(q.scale);
        batch.zero_points.push(q.zero_point);
        batch.vectors.push(q);
    }

    batch
}

/// Integer dot product over INT8 slices, 8-wide unrolled, i32 accumulators.
#[inline]
fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());

    let chunks = a.len() / 8;
    let mut sum0 = 0i32;
    let mut sum1 = 0i32;
    let mut sum2 = 0i32;
    let mut sum3 = 0i32;

    for i in 0..chunks {
        let base = i * 8;
        sum0 += i32::from(a[base]) * i32::from(b[base])
            + i32::from(a[base + 4]) * i32::from(b[base + 4]);
        sum1 += i32::from(a[base + 1]) * i32::from(b[base + 1])
            + i32::from(a[base + 5]) * i32::from(b[base + 5]);
        sum2 += i32::from(a[base + 2]) * i32::from(b[base + 2])
            + i32::from(a[base + 6]) * i32::from(b[base + 6]);
        sum3 += i32::from(a[base + 3]) * i32::from(b[base + 3])
            + i32::from(a[base + 7]) * i32::from(b[base + 7]);
    }

    let base = chunks * 8;
    for i in base..a.len() {
        sum0 += i32::from(a[i]) * i32::from(b[i]);
    }

    sum0 + sum1 + sum2 + sum3
}

/// Cosine distance between two quantized vectors, clamped to [0, 2].
///
/// Symmetric pairs run entirely in integer arithmetic: the i32 dot product
/// is rescaled by `scale_a * scale_b`. Any other combination dequantizes
/// both sides and computes the distance in float.
#[must_use]
pub fn quantized_cosine_distance(a: &QuantizedVector, b: &QuantizedVector) -> f32 {
    debug_assert_eq!(a.data.len(), b.data.len());

    if a.is_symmetric() && b.is_symmetric() {
        quantized_cosine_distance_slice(&a.data, a.scale, &b.data, b.scale)
    } else {
        distance::cosine_distance(&dequantize(a), &dequantize(b))
    }
}

/// Zero-copy symmetric cosine distance over raw INT8 slices.
///
/// Both slices must be symmetric encodings (`zero_point == 0`); flattened
/// vector stores use this to skip per-call materialization.
#[inline]
#[must_use]
pub fn quantized_cosine_distance_slice(a: &[i8], a_scale: f32, b: &[i8], b_scale: f32) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[allow(clippy::cast_precision_loss)]
    let dot = dot_i8(a, b) as f32 * a_scale * b_scale;
    (1.0 - dot).clamp(0.0, 2.0)
}

/// Round-trip quality metrics for a quantized vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationReport {
    /// Mean squared reconstruction error.
    pub mse: f32,
    /// Mean absolute reconstruction error.
    pub mae: f32,
    /// Largest absolute reconstruction error.
    pub max_abs_error: f32,
    /// Signal-to-quantization-noise ratio in dB. Infinite for an exact
    /// round trip.
    pub sqnr_db: f32,
}

/// Measures round-trip quality of `quantized` against the original vector.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn measure(original: &[f32], quantized: &QuantizedVector) -> QuantizationReport {
    debug_assert_eq!(original.len(), quantized.data.len());

    let reconstructed = dequantize(quantized);
    let n = original.len().max(1) as f32;

    let mut sq_sum = 0.0f32;
    let mut abs_sum = 0.0f32;
    let mut max_abs = 0.0f32;
    let mut signal_power = 0.0f32;

    for (&orig, &rec) in original.iter().zip(&reconstructed) {
        let err = orig - rec;
        sq_sum += err * err;
        abs_sum += err.abs();
        max_abs = max_abs.max(err.abs());
        signal_power += orig * orig;
    }

    let sqnr_db = if sq_sum == 0.0 {
        f32::INFINITY
    } else {
        10.0 * (signal_power / sq_sum).log10()
    };

    QuantizationReport {
        mse: sq_sum / n,
        mae: abs_sum / n,
        max_abs_error: max_abs,
        sqnr_db,
    }
}
