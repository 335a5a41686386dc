//! HNSW graph: insert, search and remove over the layer stack.
//!
//! The whole graph sits behind one `RwLock`: searches share a read lock,
//! inserts and removals take the write lock and exclude all others. Pure
//! vector math never holds I/O locks.

use super::layer::{Layer, NodeId};
use super::ordered_float::OrderedFloat;
use super::params::HnswParams;
use super::snapshot;
use super::vectors::{EncodedQuery, VectorStore};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::quantization;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Hard cap on the layer count; levels above this are folded down.
const MAX_LEVEL: usize = 16;

/// A search hit: external id plus distance under the index metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// External id of the matched vector.
    pub id: String,
    /// Distance to the query (lower is closer).
    pub distance: f32,
}

/// Summary statistics for monitoring and the CLI report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    /// Live node count.
    pub node_count: usize,
    /// Highest occupied level.
    pub max_level: usize,
    /// Average out-degree at level 0.
    pub avg_out_degree: f32,
    /// Whether INT8 traversal is enabled.
    pub quantized: bool,
    /// Embedding dimension.
    pub dimension: usize,
}

#[derive(Debug)]
pub(super) struct HnswInner {
    pub(super) dimension: usize,
    pub(super) metric: DistanceMetric,
    pub(super) params: HnswParams,
    pub(super) vectors: VectorStore,
    pub(super) layers: Vec<Layer>,
    /// Slot -> assigned level.
    pub(super) levels: Vec<usize>,
    /// Slot -> external id. `None` marks a vacated slot.
    pub(super) ids: Vec<Option<String>>,
    pub(super) id_to_slot: rustc_hash::FxHashMap<String, NodeId>,
    pub(super) free_slots: Vec<NodeId>,
    pub(super) entry_point: Option<NodeId>,
    pub(super) rng_state: u64,
}

/// Multi-layer small-world graph over unit-normalized vectors.
///
/// Vectors are keyed by opaque string ids. Insert and remove mutate the
/// graph; searches are total and return `min(k, len)` results.
#[derive(Debug)]
pub struct HnswIndex {
    inner: RwLock<HnswInner>,
}

impl HnswIndex {
    /// Creates an empty float-precision index.
    #[must_use]
    pub fn new(dimension: usize, metric: DistanceMetric, params: HnswParams) -> Self {
        Self::build(dimension, metric, params, false)
    }

    /// Creates an empty index with INT8 traversal and float re-ranking.
    ///
    /// Quantized traversal computes cosine distances on symmetric INT8
    /// codes; the final candidate pool is re-ranked against the float
    /// originals.
    #[must_use]
    pub fn with_quantization(dimension: usize, params: HnswParams) -> Self {
        Self::build(dimension, DistanceMetric::Cosine, params, true)
    }

    fn build(dimension: usize, metric: DistanceMetric, params: HnswParams, quantized: bool) -> Self {
        Self {
            inner: RwLock::new(HnswInner {
                dimension,
                metric,
                params,
                vectors: VectorStore::new(quantized),
                layers: vec![Layer::new(0)],
                levels: Vec::new(),
                ids: Vec::new(),
                id_to_slot: rustc_hash::FxHashMap::default(),
                free_slots: Vec::new(),
                entry_point: None,
                rng_state: 0x5DEE_CE66_D1A4_B5B5,
            }),
        }
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().id_to_slot.len()
    }

    /// True when the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `id` is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().id_to_slot.contains_key(id)
    }

    /// Summary statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        let node_count = inner.id_to_slot.len();
        let degree_sum: usize = inner
            .id_to_slot
            .values()
            .map(|&slot| inner.layers[0].degree(slot))
            .sum();
        let max_level = inner
            .id_to_slot
            .values()
            .map(|&slot| inner.levels[slot])
            .max()
            .unwrap_or(0);

        IndexStats {
            node_count,
            max_level,
            avg_out_degree: if node_count == 0 {
                0.0
            } else {
                degree_sum as f32 / node_count as f32
            },
            quantized: inner.vectors.is_quantized(),
            dimension: inner.dimension,
        }
    }

    /// Inserts a vector under `id`, replacing any existing vector with the
    /// same id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] when the vector length differs
    /// from the index dimension, or [`Error::InvalidInput`] for non-finite
    /// components.
    pub fn insert(&self, id: impl Into<String>, vector: &[f32]) -> Result<()> {
        let id = id.into();
        let mut inner = self.inner.write();
        inner.validate_vector(vector)?;

        if let Some(&slot) = inner.id_to_slot.get(&id) {
            inner.detach(slot);
        }

        inner.insert_node(id, vector.to_vec());
        Ok(())
    }

    /// Searches for the `k` nearest neighbors with the configured
    /// `ef_search`.
    ///
    /// # Errors
    ///
    /// Returns an error only for malformed queries (wrong dimension or
    /// non-finite values). Well-formed queries always return
    /// `min(k, len)` results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let ef = self.inner.read().params.ef_search;
        self.search_with_ef(query, k, ef)
    }

    /// Searches with an explicit `ef` beam width.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::search`].
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<Neighbor>> {
        let inner = self.inner.read();
        inner.validate_vector(query)?;

        let Some(ep) = inner.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let encoded = inner.encode_query(query);
        let entry_level = inner.levels[ep];

        let mut current = ep;
        for level in (1..=entry_level).rev() {
            current = inner.greedy_descent(&encoded, current, level);
        }

        let beam = ef.max(k).max(inner.rerank_pool(k));
        let candidates = inner.search_layer(&encoded, &[current], beam, 0);

        Ok(inner.rank_results(&encoded, candidates, k))
    }

    /// Removes `id` from the index.
    ///
    /// Returns `true` when the id existed. Removing the entry point elects
    /// the remaining node with the highest level as the new entry.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(&slot) = inner.id_to_slot.get(id) else {
            return false;
        };
        inner.detach(slot);
        true
    }

    /// Serializes the index into a self-describing byte buffer.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the buffer cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        snapshot::encode(&inner)
    }

    /// Reconstructs an index from a buffer produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for malformed buffers.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = snapshot::decode(bytes)?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }
}

impl HnswInner {
    fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "vector contains non-finite components".into(),
            ));
        }
        Ok(())
    }

    fn encode_query<'a>(&self, query: &'a [f32]) -> EncodedQuery<'a> {
        if self.vectors.is_quantized() {
            EncodedQuery::Quantized {
                codes: quantization::quantize_symmetric(query),
                raw: query,
            }
        } else {
            EncodedQuery::Float {
                raw: query,
                metric: self.metric,
            }
        }
    }

    /// Candidate pool size subject to final re-ranking.
    fn rerank_pool(&self, k: usize) -> usize {
        if self.vectors.is_quantized() {
            k.saturating_mul(self.params.rerank_multiplier).max(k)
        } else {
            k
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn random_level(&mut self) -> usize {
        // xorshift64; avoids carrying an RNG dependency for one sample.
        let mut state = self.rng_state;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state = state;

        let uniform = (state >> 11) as f64 / (1u64 << 53) as f64;
        let u = 1.0 - uniform; // (0, 1]
        let level = (-u.ln() * self.params.level_mult()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn allocate_slot(&mut self, id: String, vector: Vec<f32>, level: usize) -> NodeId {
        let slot = if let Some(slot) = self.free_slots.pop() {
            slot
        } else {
            let slot = self.ids.len();
            self.ids.push(None);
            self.levels.push(0);
            slot
        };

        self.vectors.put(slot, vector);
        self.ids[slot] = Some(id.clone());
        self.levels[slot] = level;
        self.id_to_slot.insert(id, slot);

        while self.layers.len() <= level {
            self.layers.push(Layer::new(self.ids.len()));
        }
        for layer in &mut self.layers {
            layer.ensure_capacity(slot);
        }

        slot
    }

    fn insert_node(&mut self, id: String, vector: Vec<f32>) {
        let level = self.random_level();
        let slot = self.allocate_slot(id, vector.clone(), level);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            return;
        };

        let entry_level = self.levels[entry];
        let query = self.encode_query(&vector);

        // Greedy single-candidate descent above the insertion level.
        let mut current = entry;
        for layer in (level + 1..=entry_level).rev() {
            current = self.greedy_descent(&query, current, layer);
        }

        // Beam search and diverse linking from min(level, entry_level) to 0.
        for layer in (0..=level.min(entry_level)).rev() {
            let candidates = self.search_layer(&query, &[current], self.params.ef_construction, layer);
            if candidates.is_empty() {
                continue;
            }
            current = candidates[0].0;

            let cap = self.params.max_connections(layer);
            let select = if layer == 0 {
                self.params.m_max0()
            } else {
                self.params.m
            };
            let selected = self.select_diverse(&candidates, select, slot);

            for &neighbor in &selected {
                self.layers[layer].add_neighbor(slot, neighbor);
                self.layers[layer].add_neighbor(neighbor, slot);
                if self.layers[layer].degree(neighbor) > cap {
                    self.prune(neighbor, layer, cap);
                }
            }
        }

        if level > entry_level {
            self.entry_point = Some(slot);
        }
    }

    fn slot_distance(&self, a: NodeId, b: NodeId) -> f32 {
        if self.vectors.is_quantized() {
            self.vectors.quantized_slot_distance(a, b)
        } else {
            self.metric
                .distance(self.vectors.float(a), self.vectors.float(b))
        }
    }

    fn greedy_descent(&self, query: &EncodedQuery<'_>, entry: NodeId, layer: usize) -> NodeId {
        let mut best = entry;
        let mut best_dist = self.vectors.traversal_distance(query, best);

        loop {
            let mut improved = false;
            for &neighbor in self.layers[layer].neighbors(best) {
                let dist = self.vectors.traversal_distance(query, neighbor);
                if dist < best_dist {
                    best = neighbor;
                    best_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Beam search over one layer. Returns candidates sorted by ascending
    /// distance.
    fn search_layer(
        &self,
        query: &EncodedQuery<'_>,
        entry_points: &[NodeId],
        ef: usize,
        layer: usize,
    ) -> Vec<(NodeId, f32)> {
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, NodeId)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat, NodeId)> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let dist = self.vectors.traversal_distance(query, ep);
                candidates.push(Reverse((OrderedFloat(dist), ep)));
                results.push((OrderedFloat(dist), ep));
            }
        }

        while let Some(Reverse((OrderedFloat(dist), node))) = candidates.pop() {
            let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
            if dist > furthest && results.len() >= ef {
                break;
            }

            for &neighbor in self.layers[layer].neighbors(node) {
                if visited.insert(neighbor) {
                    let d = self.vectors.traversal_distance(query, neighbor);
                    let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    if d < furthest || results.len() < ef {
                        candidates.push(Reverse((OrderedFloat(d), neighbor)));
                        results.push((OrderedFloat(d), neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(NodeId, f32)> = results.into_iter().map(|(d, n)| (n, d.0)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Diversity-preferring neighbor selection.
    ///
    /// A candidate is kept only when it is strictly closer to the query
    /// node than to every already-selected neighbor; the quota is then
    /// backfilled by plain closeness.
    fn select_diverse(
        &self,
        candidates: &[(NodeId, f32)],
        max_neighbors: usize,
        exclude: NodeId,
    ) -> Vec<NodeId> {
        let mut selected: Vec<NodeId> = Vec::with_capacity(max_neighbors);

        for &(candidate, dist_to_query) in candidates {
            if candidate == exclude || selected.len() >= max_neighbors {
                continue;
            }
            let diverse = selected
                .iter()
                .all(|&s| dist_to_query < self.slot_distance(candidate, s));
            if diverse {
                selected.push(candidate);
            }
        }

        if selected.len() < max_neighbors {
            for &(candidate, _) in candidates {
                if selected.len() >= max_neighbors {
                    break;
                }
                if candidate != exclude && !selected.contains(&candidate) {
                    selected.push(candidate);
                }
            }
        }

        selected
    }

    /// Re-applies the selection heuristic to an over-full neighbor list.
    fn prune(&mut self, node: NodeId, layer: usize, cap: usize) {
        let mut with_dist: Vec<(NodeId, f32)> = self.layers[layer]
            .neighbors(node)
            .iter()
            .map(|&n| (n, self.slot_distance(node, n)))
            .collect();
        with_dist.sort_by(|a, b| a.1.total_cmp(&b.1));

        let pruned = self.select_diverse(&with_dist, cap, node);
        debug_assert!(pruned.len() <= cap, "prune exceeded the per-layer cap");
        self.layers[layer].set_neighbors(node, pruned);
    }

    /// Unlinks `slot` from every layer and vacates it.
    ///
    /// Pruning makes links asymmetric, so a full per-layer sweep removes
    /// straggler references that a neighbors-of-neighbors scan would miss.
    fn detach(&mut self, slot: NodeId) {
        let level = self.levels[slot];
        for layer in 0..=level {
            self.layers[layer].take_neighbors(slot);
            self.layers[layer].purge_references(slot);
        }

        if let Some(id) = self.ids[slot].take() {
            self.id_to_slot.remove(&id);
        }
        self.free_slots.push(slot);

        if self.entry_point == Some(slot) {
            self.entry_point = self
                .id_to_slot
                .values()
                .copied()
                .max_by_key(|&s| self.levels[s]);
        }
    }

    fn rank_results(
        &self,
        query: &EncodedQuery<'_>,
        candidates: Vec<(NodeId, f32)>,
        k: usize,
    ) -> Vec<Neighbor> {
        let to_neighbor = |(slot, distance): (NodeId, f32)| -> Option<Neighbor> {
            self.ids[slot].as_ref().map(|id| Neighbor {
                id: id.clone(),
                distance,
            })
        };

        if !self.vectors.is_quantized() {
            return candidates.into_iter().take(k).filter_map(to_neighbor).collect();
        }

        // Quantized traversal: re-rank the candidate pool against the float
        // originals before cutting to k.
        let pool = self.rerank_pool(k);
        let raw = query.raw();
        let mut reranked: Vec<(NodeId, f32)> = candidates
            .into_iter()
            .take(pool)
            .map(|(slot, _)| {
                (
                    slot,
                    DistanceMetric::Cosine.distance(raw, self.vectors.float(slot)),
                )
            })
            .collect();
        reranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        reranked.into_iter().take(k).filter_map(to_neighbor).collect()
    }
}
