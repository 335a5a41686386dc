//! Vector index implementations.
//!
//! The only production index is [`hnsw::HnswIndex`], a multi-layer
//! navigable small-world graph with optional INT8 traversal.

pub mod hnsw;

pub use hnsw::{HnswIndex, HnswParams, IndexStats, Neighbor};
