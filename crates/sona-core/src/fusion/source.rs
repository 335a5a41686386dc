//! Search sources feeding the fusion engine.
//!
//! Each source returns raw hits `{id, content, score in [0,1], metadata}`.
//! Sources are queried as independent tasks, so the trait hands out owned
//! futures over `Arc`-shared state.

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::hnsw::HnswIndex;
use crate::knowledge::KnowledgeStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Owned boxed future, the return type of [`SearchSource::search`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The four fusion sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// HNSW top-k by embedding.
    Vector,
    /// Knowledge-graph traversal from query seed nodes.
    Graph,
    /// Knowledge store filtered by domain/tags.
    Memory,
    /// Lexical, confidence-filtered pattern store.
    Pattern,
}

impl SourceKind {
    /// Position in the weight array.
    #[must_use]
    pub const fn weight_index(self) -> usize {
        match self {
            Self::Vector => 0,
            Self::Graph => 1,
            Self::Memory => 2,
            Self::Pattern => 3,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Graph => "graph",
            Self::Memory => "memory",
            Self::Pattern => "pattern",
        }
    }
}

/// One fusion query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// The query text.
    pub query_text: String,
    /// Query embedding of dimension D.
    pub embedding: Vec<f32>,
    /// Optional domain filter for the memory source.
    pub domain: Option<String>,
    /// Optional tag filter for the memory source.
    pub tags: Vec<String>,
    /// Requested number of fused results.
    pub top_k: usize,
}

/// A raw result from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    /// Source-local id.
    pub id: String,
    /// Content used for dedup and display.
    pub content: String,
    /// Source-normalized score in [0, 1].
    pub score: f32,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Terminal state of one source within a fusion query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// The source returned within its deadline.
    Responded {
        /// Raw hits contributed.
        hits: usize,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// The source missed its deadline and was dropped.
    TimedOut {
        /// Wall time in milliseconds (the deadline).
        duration_ms: u64,
    },
    /// The source failed.
    Errored {
        /// Error text.
        message: String,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
}

impl SourceOutcome {
    /// True for [`SourceOutcome::Responded`].
    #[must_use]
    pub const fn responded(&self) -> bool {
        matches!(self, Self::Responded { .. })
    }
}

/// A fusion search source.
///
/// `search` takes `Arc<Self>` so the engine can run every source as an
/// independent task with its own deadline.
pub trait SearchSource: Send + Sync + 'static {
    /// Which of the four sources this is.
    fn kind(&self) -> SourceKind;

    /// Runs the query, returning raw hits.
    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>>;
}

/// Pre-search embedding transform (GNN enhancement hook).
pub trait EmbeddingEnhancer: Send + Sync + 'static {
    /// Transforms the raw query embedding using graph context.
    ///
    /// # Errors
    ///
    /// Implementation-defined; failures trip the circuit breaker.
    fn enhance(&self, embedding: &[f32]) -> Result<Vec<f32>>;
}

// =============================================================================
// Built-in adapters
// =============================================================================

/// Vector source over the HNSW index.
pub struct VectorIndexSource {
    index: Arc<HnswIndex>,
}

impl VectorIndexSource {
    /// Wraps an index.
    #[must_use]
    pub fn new(index: Arc<HnswIndex>) -> Self {
        Self { index }
    }
}

impl SearchSource for VectorIndexSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Vector
    }

    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            let index = Arc::clone(&self.index);
            let hits = tokio::task::spawn_blocking(move || {
                index.search(&request.embedding, request.top_k)
            })
            .await
            .map_err(|e| Error::Internal(format!("vector source join error: {e}")))??;

            Ok(hits
                .into_iter()
                .map(|n| RawHit {
                    content: n.id.clone(),
                    score: DistanceMetric::Cosine
                        .similarity_from_distance(n.distance)
                        .clamp(0.0, 1.0),
                    id: n.id,
                    metadata: None,
                })
                .collect())
        })
    }
}

/// Opaque node/edge source behind the graph adapter.
pub trait GraphAccess: Send + Sync + 'static {
    /// Seed node ids extracted from the query text.
    fn seeds(&self, query_text: &str) -> Vec<String>;

    /// Outgoing neighbor ids of a node.
    fn neighbors(&self, node: &str) -> Vec<String>;

    /// Content and base relevance of a node, when it exists.
    fn node_content(&self, node: &str) -> Option<(String, f32)>;
}

/// Graph source: breadth-first traversal of bounded depth from the query
/// seeds, with scores decaying by hop distance.
pub struct GraphTraversalSource<G: GraphAccess> {
    graph: Arc<G>,
    depth: usize,
}

impl<G: GraphAccess> GraphTraversalSource<G> {
    /// Wraps a graph with the configured traversal depth.
    #[must_use]
    pub fn new(graph: Arc<G>, depth: usize) -> Self {
        Self { graph, depth }
    }
}

impl<G: GraphAccess> SearchSource for GraphTraversalSource<G> {
    fn kind(&self) -> SourceKind {
        SourceKind::Graph
    }

    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            let mut visited: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
            let mut frontier = self.graph.seeds(&request.query_text);
            let mut hits = Vec::new();

            for hop in 0..=self.depth {
                #[allow(clippy::cast_precision_loss)]
                let decay = 1.0 / (hop as f32 + 1.0);
                let mut next = Vec::new();

                for node in frontier.drain(..) {
                    if !visited.insert(node.clone()) {
                        continue;
                    }
                    if let Some((content, relevance)) = self.graph.node_content(&node) {
                        hits.push(RawHit {
                            id: node.clone(),
                            content,
                            score: (relevance * decay).clamp(0.0, 1.0),
                            metadata: Some(serde_json::json!({ "hop": hop })),
                        });
                    }
                    if hop < self.depth {
                        next.extend(self.graph.neighbors(&node));
                    }
                }
                frontier = next;
            }

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(request.top_k);
            Ok(hits)
        })
    }
}

/// Memory source: knowledge-store query filtered by domain and tags.
pub struct MemoryPatternSource<K: KnowledgeStore> {
    store: Arc<K>,
}

impl<K: KnowledgeStore> MemoryPatternSource<K> {
    /// Wraps a knowledge store.
    #[must_use]
    pub fn new(store: Arc<K>) -> Self {
        Self { store }
    }
}

impl<K: KnowledgeStore> SearchSource for MemoryPatternSource<K> {
    fn kind(&self) -> SourceKind {
        SourceKind::Memory
    }

    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            let entries = self.store.query(
                request.domain.as_deref(),
                &request.tags,
                request.top_k,
            )?;
            Ok(entries
                .into_iter()
                .map(|e| RawHit {
                    id: e.id,
                    content: e.content,
                    score: e.quality.clamp(0.0, 1.0),
                    metadata: Some(serde_json::json!({ "domain": e.domain })),
                })
                .collect())
        })
    }
}

/// Pattern source: lexical match over the pattern store with a confidence
/// floor.
pub struct LexicalPatternSource<K: KnowledgeStore> {
    store: Arc<K>,
    min_confidence: f32,
}

impl<K: KnowledgeStore> LexicalPatternSource<K> {
    /// Wraps a knowledge store with a confidence floor.
    #[must_use]
    pub fn new(store: Arc<K>, min_confidence: f32) -> Self {
        Self {
            store,
            min_confidence,
        }
    }
}

impl<K: KnowledgeStore> SearchSource for LexicalPatternSource<K> {
    fn kind(&self) -> SourceKind {
        SourceKind::Pattern
    }

    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            let patterns = self.store.query_patterns(
                &request.query_text,
                self.min_confidence,
                request.top_k,
            )?;
            Ok(patterns
                .into_iter()
                .map(|p| RawHit {
                    id: p.pattern_id,
                    content: p.content,
                    score: p.confidence.clamp(0.0, 1.0),
                    metadata: p.metadata,
                })
                .collect())
        })
    }
}
