//! SONA configuration module.
//!
//! Provides configuration file support via `sona.toml`, environment
//! variables, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (builder methods)
//! 2. Environment variables (`SONA_*`)
//! 3. Configuration file (`sona.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration sources.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// HNSW index configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Neighbors per node per non-zero level (M parameter).
    pub m: usize,
    /// Candidate list size during insertion.
    pub ef_construction: usize,
    /// Candidate list size during queries.
    pub ef_search: usize,
    /// Store INT8 vectors and re-rank against float originals.
    pub quantized: bool,
    /// Re-rank pool size as a multiple of k (quantized mode only).
    pub rerank_multiplier: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            quantized: false,
            rerank_multiplier: 2,
        }
    }
}

/// Episode cache configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached episodes.
    pub max_size: usize,
    /// Optional memory cap in bytes. `None` disables byte accounting.
    pub max_memory_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_memory_bytes: None,
        }
    }
}

/// Trajectory stream configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Maximum trajectories held in the memory window.
    pub memory_window_size: usize,
    /// Queued entries that trigger a batch flush.
    pub batch_write_size: usize,
    /// Milliseconds after which a non-empty queue is flushed regardless of size.
    pub batch_write_interval_ms: u64,
    /// Maximum concurrent point lookups against the disk reader.
    pub max_concurrent_queries: usize,
    /// Entries kept in the disk reader's record cache.
    pub reader_cache_size: usize,
    /// Write a backup of the source log before migrating.
    pub backup_on_migration: bool,
    /// Compress record payloads with LZ4.
    pub compress: bool,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            memory_window_size: 1000,
            batch_write_size: 10,
            batch_write_interval_ms: 5000,
            max_concurrent_queries: 10,
            reader_cache_size: 256,
            backup_on_migration: true,
            compress: true,
        }
    }
}

/// Quad-fusion search configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Per-source deadline in milliseconds (capped at 500).
    pub source_timeout_ms: u64,
    /// Default number of fused results to return.
    pub top_k: usize,
    /// Hard cap on requested `top_k`.
    pub max_top_k: usize,
    /// Source weights: vector, graph, memory, pattern. Must sum to 1.
    pub weights: [f32; 4],
    /// Traversal depth for the graph source.
    pub graph_depth: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 400,
            top_k: 10,
            max_top_k: 100,
            weights: [0.4, 0.3, 0.2, 0.1],
            graph_depth: 2,
        }
    }
}

/// Routing learner configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Learning rate (eta).
    pub learning_rate: f32,
    /// EWC regularization strength (lambda).
    pub ewc_lambda: f32,
    /// Per-update clip on the effective delta.
    pub max_delta: f32,
    /// Rolling accuracy window length.
    pub accuracy_window: usize,
    /// Accuracy drop versus checkpoint that triggers rollback.
    pub degradation_threshold: f32,
    /// Minimum history length before rollback can trigger.
    pub min_history: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            ewc_lambda: 0.1,
            max_delta: 0.05,
            accuracy_window: 100,
            degradation_threshold: 0.02,
            min_history: 10,
        }
    }
}

/// Storage paths configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root. Episodes land in `learning.db`, trajectories under
    /// `sona/trajectories/`, knowledge files under `knowledge/`.
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "./sona-data".to_string(),
        }
    }
}

/// Top-level SONA configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SonaConfig {
    /// Embedding dimension D, fixed per deployment.
    pub dimension: usize,
    /// HNSW index section.
    pub index: IndexConfig,
    /// Episode cache section.
    pub cache: CacheConfig,
    /// Trajectory stream section.
    pub trajectory: TrajectoryConfig,
    /// Quad-fusion section.
    pub fusion: FusionConfig,
    /// Routing learner section.
    pub routing: RoutingConfig,
    /// Storage paths section.
    pub storage: StorageConfig,
}

impl Default for SonaConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            trajectory: TrajectoryConfig::default(),
            fusion: FusionConfig::default(),
            routing: RoutingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl SonaConfig {
    /// Loads configuration from defaults, an optional `sona.toml` and
    /// `SONA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source fails to parse or a value fails
    /// validation.
    pub fn load<P: AsRef<Path>>(config_file: Option<P>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path.as_ref()));
        } else {
            figment = figment.merge(Toml::file("sona.toml"));
        }

        let config: Self = figment
            .merge(Env::prefixed("SONA_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dimension".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.index.m < 2 {
            return Err(ConfigError::InvalidValue {
                key: "index.m".into(),
                message: "M must be at least 2".into(),
            });
        }
        if self.index.ef_construction < self.index.m {
            return Err(ConfigError::InvalidValue {
                key: "index.ef_construction".into(),
                message: "must be at least M".into(),
            });
        }
        if self.fusion.source_timeout_ms > 500 {
            return Err(ConfigError::InvalidValue {
                key: "fusion.source_timeout_ms".into(),
                message: "per-source deadline is capped at 500ms".into(),
            });
        }
        let weight_sum: f32 = self.fusion.weights.iter().sum();
        if (weight_sum - 1.0).abs() > 1e-3 {
            return Err(ConfigError::InvalidValue {
                key: "fusion.weights".into(),
                message: format!("weights must sum to 1.0, got {weight_sum:.4}"),
            });
        }
        if self.fusion.weights.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "fusion.weights".into(),
                message: "weights must be non-negative".into(),
            });
        }
        if self.fusion.top_k == 0 || self.fusion.top_k > self.fusion.max_top_k {
            return Err(ConfigError::InvalidValue {
                key: "fusion.top_k".into(),
                message: format!("must be in 1..={}", self.fusion.max_top_k),
            });
        }
        if self.routing.max_delta <= 0.0 || self.routing.max_delta > 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "routing.max_delta".into(),
                message: "must be in (0, 1]".into(),
            });
        }
        if self.trajectory.batch_write_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "trajectory.batch_write_size".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.trajectory.max_concurrent_queries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "trajectory.max_concurrent_queries".into(),
                message: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = SonaConfig::default();
        assert_eq!(config.dimension, 1536);
        assert_eq!(config.index.m, 16);
        assert_eq!(config.index.ef_construction, 200);
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.trajectory.batch_write_size, 10);
        assert_eq!(config.trajectory.batch_write_interval_ms, 5000);
        assert_eq!(config.fusion.source_timeout_ms, 400);
        assert_eq!(config.fusion.weights, [0.4, 0.3, 0.2, 0.1]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_weights() {
        let mut config = SonaConfig::default();
        config.fusion.weights = [0.5, 0.5, 0.5, 0.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversize_timeout() {
        let mut config = SonaConfig::default();
        config.fusion.source_timeout_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sona.toml");
        std::fs::write(&path, "dimension = 768\n[index]\nm = 32\n").unwrap();

        let config = SonaConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dimension, 768);
        assert_eq!(config.index.m, 32);
        // Untouched sections keep defaults.
        assert_eq!(config.cache.max_size, 1000);
    }
}
