//! Vector storage backing the HNSW graph.
//!
//! Float mode keeps the raw `f32` vectors. Quantized mode keeps symmetric
//! INT8 codes for traversal plus the float originals for final re-ranking.

use crate::quantization::{self, QuantizedVector};

/// Storage for node vectors, indexed by arena slot.
#[derive(Debug, Clone)]
pub(super) enum VectorStore {
    /// Raw float32 vectors.
    Float { vectors: Vec<Vec<f32>> },
    /// Symmetric INT8 codes plus the float originals used for re-ranking.
    Quantized {
        codes: Vec<Vec<i8>>,
        scales: Vec<f32>,
        zero_points: Vec<f32>,
        originals: Vec<Vec<f32>>,
    },
}

impl VectorStore {
    pub(super) fn new(quantized: bool) -> Self {
        if quantized {
            Self::Quantized {
                codes: Vec::new(),
                scales: Vec::new(),
                zero_points: Vec::new(),
                originals: Vec::new(),
            }
        } else {
            Self::Float {
                vectors: Vec::new(),
            }
        }
    }

    pub(super) const fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }

    /// Writes `vector` at `slot`, growing the storage if needed.
    pub(super) fn put(&mut self, slot: usize, vector: Vec<f32>) {
        match self {
            Self::Float { vectors } => {
                if vectors.len() <= slot {
                    vectors.resize_with(slot + 1, Vec::new);
                }
                vectors[slot] = vector;
            }
            Self::Quantized {
                codes,
                scales,
                zero_points,
                originals,
            } => {
                if codes.len() <= slot {
                    codes.resize_with(slot + 1, Vec::new);
                    scales.resize(slot + 1, 1.0);
                    zero_points.resize(slot + 1, 0.0);
                    originals.resize_with(slot + 1, Vec::new);
                }
                let q = quantization::quantize_symmetric(&vector);
                codes[slot] = q.data;
                scales[slot] = q.scale;
                zero_points[slot] = q.zero_point;
                originals[slot] = vector;
            }
        }
    }

    /// The float vector at `slot` (the original in quantized mode).
    pub(super) fn float(&self, slot: usize) -> &[f32] {
        match self {
            Self::Float { vectors } => &vectors[slot],
            Self::Quantized { originals, .. } => &originals[slot],
        }
    }

    /// Distance between an encoded query and the vector at `slot`.
    ///
    /// Quantized stores compare INT8 codes zero-copy; float stores compare
    /// raw floats. Stored codes are always symmetric, so the integer fast
    /// path applies unconditionally.
    pub(super) fn traversal_distance(&self, query: &EncodedQuery, slot: usize) -> f32 {
        match (self, query) {
            (Self::Float { vectors }, EncodedQuery::Float { raw, metric }) => {
                metric.distance(raw, &vectors[slot])
            }
            (
                Self::Quantized { codes, scales, .. },
                EncodedQuery::Quantized { codes: q, .. },
            ) => quantization::quantized_cosine_distance_slice(
                &q.data,
                q.scale,
                &codes[slot],
                scales[slot],
            ),
            _ => unreachable!("query encoding does not match the store"),
        }
    }

    /// Zero-copy distance between two stored slots (quantized mode).
    pub(super) fn quantized_slot_distance(&self, a: usize, b: usize) -> f32 {
        match self {
            Self::Float { .. } => unreachable!("quantized access on a float store"),
            Self::Quantized { codes, scales, .. } => {
                quantization::quantized_cosine_distance_slice(
                    &codes[a],
                    scales[a],
                    &codes[b],
                    scales[b],
                )
            }
        }
    }
}

/// A query pre-encoded to match the store's representation.
pub(super) enum EncodedQuery<'a> {
    Float {
        raw: &'a [f32],
        metric: crate::distance::DistanceMetric,
    },
    Quantized {
        codes: QuantizedVector,
        raw: &'a [f32],
    },
}

impl<'a> EncodedQuery<'a> {
    /// The raw float query, for re-ranking.
    pub(super) fn raw(&self) -> &'a [f32] {
        match self {
            Self::Float { raw, .. } | Self::Quantized { raw, .. } => raw,
        }
    }
}
