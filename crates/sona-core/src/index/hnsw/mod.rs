//! HNSW (Hierarchical Navigable Small World) index implementation.
//!
//! Approximate nearest-neighbor search with expected `O(log N)` queries,
//! based on Malkov & Yashunin (arXiv:1603.09320).
//!
//! # Module Organization
//!
//! - `params`: index parameters
//! - `layer`: per-layer adjacency arena
//! - `graph`: insert / search / remove over the layer stack
//! - `vectors`: float and INT8 vector storage
//! - `snapshot`: self-describing byte-buffer serialization

mod graph;
mod layer;
mod ordered_float;
mod params;
mod snapshot;
mod vectors;

pub use graph::{HnswIndex, IndexStats, Neighbor};
pub use params::HnswParams;
