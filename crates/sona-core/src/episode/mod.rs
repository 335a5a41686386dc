//! Episode persistence: append-only row store fronted by a bounded cache.
//!
//! An episode is a (query, answer) pair with dual chunk embeddings, the
//! retrieval unit injected into future prompts. Episodes and their outcome
//! rows are append-only: delete and clear return a structured
//! append-only-violation error and leave the store untouched.

mod cache;
mod cached;
mod store;

pub use cache::{CacheStats, EpisodeCache};
pub use cached::CachedEpisodeStore;
pub use store::{EpisodeStore, LogEpisodeStore, StoreStats};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A persisted (query, answer) pair with dual chunk embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Monotonic unique id.
    pub episode_id: u64,
    /// The query text.
    pub query_text: String,
    /// The answer text.
    pub answer_text: String,
    /// Embeddings of the query chunks, each of dimension D.
    pub query_chunk_embeddings: Vec<Vec<f32>>,
    /// Embeddings of the answer chunks, each of dimension D.
    pub answer_chunk_embeddings: Vec<Vec<f32>>,
    /// Creation timestamp (Unix seconds).
    pub created_at: i64,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
}

impl Episode {
    /// Number of query chunks.
    #[must_use]
    pub fn query_chunk_count(&self) -> usize {
        self.query_chunk_embeddings.len()
    }

    /// Number of answer chunks.
    #[must_use]
    pub fn answer_chunk_count(&self) -> usize {
        self.answer_chunk_embeddings.len()
    }

    /// Checks the dimension invariant for every chunk embedding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for the first chunk whose
    /// length differs from `dimension`.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        for chunk in self
            .query_chunk_embeddings
            .iter()
            .chain(&self.answer_chunk_embeddings)
        {
            if chunk.len() != dimension {
                return Err(Error::DimensionMismatch {
                    expected: dimension,
                    actual: chunk.len(),
                });
            }
        }
        Ok(())
    }

    /// Approximate in-memory size, used for cache byte accounting.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        let embeddings: usize = self
            .query_chunk_embeddings
            .iter()
            .chain(&self.answer_chunk_embeddings)
            .map(|c| c.len() * std::mem::size_of::<f32>())
            .sum();
        let metadata = self
            .metadata
            .as_ref()
            .map_or(0, |m| m.to_string().len());
        std::mem::size_of::<Self>() + self.query_text.len() + self.answer_text.len() + embeddings + metadata
    }
}

/// A success/failure record linked to an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Episode the outcome belongs to.
    pub episode_id: u64,
    /// Whether the episode's answer worked.
    pub success: bool,
    /// Optional quality score in [0, 1].
    pub quality: Option<f32>,
    /// Timestamp (Unix seconds).
    pub recorded_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(dim: usize) -> Episode {
        Episode {
            episode_id: 1,
            query_text: "how do I rotate logs".into(),
            answer_text: "use the batched writer".into(),
            query_chunk_embeddings: vec![vec![0.1; dim]],
            answer_chunk_embeddings: vec![vec![0.2; dim], vec![0.3; dim]],
            created_at: 1_700_000_000,
            metadata: None,
        }
    }

    #[test]
    fn chunk_counts_derive_from_embeddings() {
        let ep = episode(8);
        assert_eq!(ep.query_chunk_count(), 1);
        assert_eq!(ep.answer_chunk_count(), 2);
    }

    #[test]
    fn validate_catches_dimension_drift() {
        let ep = episode(8);
        assert!(ep.validate(8).is_ok());
        assert_eq!(ep.validate(16).unwrap_err().code(), "SONA-001");
    }

    #[test]
    fn approximate_size_counts_embeddings() {
        let small = episode(8).approximate_size();
        let large = episode(1536).approximate_size();
        assert!(large > small + 3 * 1500 * 4);
    }
}
