//! # SONA Core
//!
//! Persistence-and-retrieval substrate for a self-learning agent runtime.
//!
//! SONA stores *episodes* (query/answer pairs with dual embeddings),
//! *patterns* (reasoning heuristics) and *trajectories* (agent execution
//! traces), retrieves and fuses them to inject prior context into future
//! prompts, and feeds outcomes back into per-agent routing weights.
//!
//! ## Components
//!
//! - [`distance`]: pure distance kernels over fixed-dimension vectors
//! - [`quantization`]: INT8 codec with round-trip quality metrics
//! - [`index`]: native HNSW graph with optional INT8 traversal
//! - [`episode`]: append-only episode store behind a bounded LRU cache
//! - [`trajectory`]: windowed, batched, multi-process-safe trajectory log
//! - [`fusion`]: concurrent four-source search with weighted score fusion
//! - [`routing`]: EWC++ weight learner with degradation rollback
//! - [`relay`]: sequential agent pipeline driver
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sona_core::{SonaConfig, HnswIndex, DistanceMetric};
//!
//! let config = SonaConfig::load(None::<&str>)?;
//! let index = HnswIndex::new(config.dimension, DistanceMetric::Cosine, config.index.into());
//! index.insert("episode-1", &embedding)?;
//! let neighbors = index.search(&query, 10)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod distance;
pub mod episode;
pub mod error;
pub mod events;
pub mod fusion;
pub mod index;
pub mod knowledge;
pub mod quantization;
pub mod relay;
pub mod routing;
pub mod trajectory;

pub use config::SonaConfig;
pub use distance::DistanceMetric;
pub use episode::{CachedEpisodeStore, Episode, EpisodeCache, EpisodeStore, LogEpisodeStore, Outcome};
pub use error::{Error, Result};
pub use events::{Event, EventSink};
pub use fusion::QuadFusion;
pub use index::{HnswIndex, HnswParams};
pub use knowledge::{KnowledgeEntry, KnowledgeStore, Pattern};
pub use relay::RelayOrchestrator;
pub use routing::RoutingLearner;
pub use trajectory::{Trajectory, TrajectoryStream};

impl From<config::IndexConfig> for HnswParams {
    fn from(config: config::IndexConfig) -> Self {
        Self {
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            rerank_multiplier: config.rerank_multiplier,
        }
    }
}
