//! Cache-fronted episode store with similarity recall.
//!
//! Writes go to the primary store first; only a successful insert
//! populates the cache and the vector index. Reads serve from the cache
//! when possible and repopulate it on a miss. The cache is never
//! authoritative.

use super::cache::{CacheStats, EpisodeCache};
use super::store::{EpisodeStore, StoreStats};
use super::{Episode, Outcome};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::index::hnsw::HnswIndex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Episode store composition: primary DAO + LRU cache + optional HNSW
/// index over query-chunk embeddings for similarity recall.
pub struct CachedEpisodeStore<S: EpisodeStore> {
    store: S,
    cache: EpisodeCache,
    index: Option<Arc<HnswIndex>>,
    sink: EventSink,
}

impl<S: EpisodeStore> CachedEpisodeStore<S> {
    /// Wraps a primary store with a cache.
    #[must_use]
    pub fn new(store: S, cache: EpisodeCache, sink: EventSink) -> Self {
        Self {
            store,
            cache,
            index: None,
            sink,
        }
    }

    /// Attaches a vector index; inserts register query-chunk embeddings
    /// and [`Self::recall_similar`] becomes available.
    #[must_use]
    pub fn with_index(mut self, index: Arc<HnswIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Reference to the primary store.
    #[must_use]
    pub fn primary(&self) -> &S {
        &self.store
    }

    /// Cache hit/miss/eviction counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Returns episodes most similar to `query_embedding`, ranked by the
    /// best-matching query chunk.
    ///
    /// # Errors
    ///
    /// Fails when no index is attached, the query is malformed, or an
    /// episode row cannot be read.
    pub fn recall_similar(&self, query_embedding: &[f32], k: usize) -> Result<Vec<(Episode, f32)>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no vector index attached".into()))?;

        // Over-fetch chunk hits: several chunks can map to one episode.
        let hits = index.search(query_embedding, k.saturating_mul(4).max(k))?;

        let mut best: FxHashMap<u64, f32> = FxHashMap::default();
        let mut order: Vec<u64> = Vec::new();
        for hit in hits {
            let Some(episode_id) = parse_chunk_id(&hit.id) else {
                continue;
            };
            let similarity = 1.0 - hit.distance;
            match best.get_mut(&episode_id) {
                Some(existing) => {
                    if similarity > *existing {
                        *existing = similarity;
                    }
                }
                None => {
                    best.insert(episode_id, similarity);
                    order.push(episode_id);
                }
            }
        }

        let mut results = Vec::with_capacity(order.len().min(k));
        for episode_id in order {
            if results.len() >= k {
                break;
            }
            if let Some(episode) = self.get(episode_id)? {
                results.push((episode, best[&episode_id]));
            }
        }
        results.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(results)
    }

    /// Cache-aware point lookup.
    ///
    /// # Errors
    ///
    /// Fails when the primary store read fails.
    pub fn get(&self, id: u64) -> Result<Option<Episode>> {
        if let Some(episode) = self.cache.get(id) {
            self.sink.emit(Event::CacheHit {
                cache_name: "episodes",
                key: id.to_string(),
            });
            return Ok(Some(episode));
        }

        self.sink.emit(Event::CacheMiss {
            cache_name: "episodes",
            key: id.to_string(),
        });

        let found = self.store.find_by_id(id)?;
        if let Some(episode) = &found {
            self.cache.set(id, episode.clone());
        }
        Ok(found)
    }
}

impl<S: EpisodeStore> EpisodeStore for CachedEpisodeStore<S> {
    fn insert(&self, episode: &Episode) -> Result<()> {
        // Primary store first; the cache is populated only on success.
        self.store.insert(episode)?;

        if let Some(index) = &self.index {
            for (chunk, embedding) in episode.query_chunk_embeddings.iter().enumerate() {
                index.insert(chunk_id(episode.episode_id, chunk), embedding)?;
            }
        }

        self.cache.set(episode.episode_id, episode.clone());
        Ok(())
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Episode>> {
        self.get(id)
    }

    fn find_all(&self) -> Result<Vec<Episode>> {
        self.store.find_all()
    }

    fn count(&self) -> Result<usize> {
        self.store.count()
    }

    fn exists(&self, id: u64) -> Result<bool> {
        self.store.exists(id)
    }

    fn record_outcome(&self, outcome: &Outcome) -> Result<()> {
        self.store.record_outcome(outcome)
    }

    fn success_rate(&self, episode_id: u64) -> Result<Option<f32>> {
        self.store.success_rate(episode_id)
    }

    fn outcome_count(&self, episode_id: u64) -> Result<usize> {
        self.store.outcome_count(episode_id)
    }

    fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn close(&self) -> Result<()> {
        self.store.close()
    }
}

fn chunk_id(episode_id: u64, chunk: usize) -> String {
    format!("ep{episode_id}:q{chunk}")
}

fn parse_chunk_id(id: &str) -> Option<u64> {
    id.strip_prefix("ep")?.split(':').next()?.parse().ok()
}
