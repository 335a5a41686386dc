//! Quad-fusion search: concurrent fan-out over four sources with
//! per-source deadlines, content dedup and weighted score fusion.
//!
//! # Module Organization
//!
//! - `source`: the [`SearchSource`] trait and the built-in adapters
//! - `breaker`: circuit breaker guarding the optional GNN pre-search hook
//! - `engine`: the [`QuadFusion`] orchestrator

mod breaker;
mod engine;
mod source;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use engine::{FusedHit, FusionResponse, QuadFusion, SourceReport};
pub use source::{
    BoxFuture, EmbeddingEnhancer, GraphAccess, GraphTraversalSource, LexicalPatternSource,
    MemoryPatternSource, RawHit, SearchRequest, SearchSource, SourceKind, SourceOutcome,
    VectorIndexSource,
};

#[cfg(test)]
mod engine_tests;
