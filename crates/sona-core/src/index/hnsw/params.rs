//! HNSW index parameters.

use serde::{Deserialize, Serialize};

/// Tunable parameters of an HNSW index.
///
/// `m_max0` (the level-0 connection cap) is derived as `2 * m` and the
/// level-assignment multiplier as `1 / ln(m)`, both per the original paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Neighbors per node per non-zero level.
    pub m: usize,
    /// Dynamic candidate list size during insertion.
    pub ef_construction: usize,
    /// Dynamic candidate list size during queries.
    pub ef_search: usize,
    /// Re-rank pool size as a multiple of `k` (quantized mode only).
    pub rerank_multiplier: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            rerank_multiplier: 2,
        }
    }
}

impl HnswParams {
    /// Connection cap at level 0.
    #[must_use]
    pub const fn m_max0(&self) -> usize {
        self.m * 2
    }

    /// Connection cap at the given level.
    #[must_use]
    pub const fn max_connections(&self, level: usize) -> usize {
        if level == 0 {
            self.m_max0()
        } else {
            self.m
        }
    }

    /// Level-assignment multiplier `1 / ln(M)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn level_mult(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_derived_values() {
        let params = HnswParams::default();
        assert_eq!(params.m, 16);
        assert_eq!(params.m_max0(), 32);
        assert_eq!(params.max_connections(0), 32);
        assert_eq!(params.max_connections(3), 16);
        assert!((params.level_mult() - 1.0 / 16f64.ln()).abs() < 1e-12);
    }
}
