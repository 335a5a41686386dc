//! Size- and memory-bounded LRU cache for episodes.
//!
//! Backed by an `IndexMap` so insertion order doubles as recency order
//! (front = LRU, back = MRU) with O(1) operations. Two caps apply at the
//! same time: an entry-count cap and an optional byte cap fed by
//! [`Episode::approximate_size`]. Every eviction fires the optional
//! callback and a `cache_eviction` event.

use super::Episode;
use crate::events::{Event, EventSink};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Eviction callback signature: `(evicted_key, evicted_episode)`.
pub type EvictionCallback = Box<dyn Fn(u64, &Episode) + Send + Sync>;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    episode: Episode,
    size: usize,
}

struct CacheInner {
    map: IndexMap<u64, CacheEntry>,
    memory_bytes: usize,
}

/// LRU episode cache with simultaneous count and byte caps.
pub struct EpisodeCache {
    name: &'static str,
    max_size: usize,
    max_memory_bytes: Option<usize>,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sink: EventSink,
    on_evict: Option<EvictionCallback>,
}

impl EpisodeCache {
    /// Creates a cache with the given caps.
    #[must_use]
    pub fn new(max_size: usize, max_memory_bytes: Option<usize>, sink: EventSink) -> Self {
        Self {
            name: "episodes",
            max_size: max_size.max(1),
            max_memory_bytes,
            inner: Mutex::new(CacheInner {
                map: IndexMap::with_capacity(max_size.min(4096)),
                memory_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sink,
            on_evict: None,
        }
    }

    /// Registers an eviction callback invoked for every evicted entry.
    #[must_use]
    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted memory in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.inner.lock().memory_bytes
    }

    /// Gets an episode and refreshes its recency.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Episode> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.shift_remove(&key) {
            let episode = entry.episode.clone();
            inner.map.insert(key, entry);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(episode)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Gets an episode without touching recency.
    #[must_use]
    pub fn peek(&self, key: u64) -> Option<Episode> {
        self.inner.lock().map.get(&key).map(|e| e.episode.clone())
    }

    /// Inserts an episode at the most-recent position, evicting as needed.
    ///
    /// Entries larger than the byte cap on their own are not cached at
    /// all, keeping the post-insert accounting inside both caps.
    pub fn set(&self, key: u64, episode: Episode) {
        let size = episode.approximate_size();

        if let Some(cap) = self.max_memory_bytes {
            if size > cap {
                return;
            }
        }

        let mut inner = self.inner.lock();

        if let Some(previous) = inner.map.shift_remove(&key) {
            inner.memory_bytes -= previous.size;
        }

        while inner.map.len() >= self.max_size {
            self.evict_lru(&mut inner);
        }
        if let Some(cap) = self.max_memory_bytes {
            while !inner.map.is_empty() && inner.memory_bytes + size > cap {
                self.evict_lru(&mut inner);
            }
        }

        inner.memory_bytes += size;
        inner.map.insert(key, CacheEntry { episode, size });
    }

    /// Drops an entry from the cache. Cache entries may be evicted freely;
    /// this never touches the primary store.
    pub fn remove(&self, key: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.shift_remove(&key) {
            inner.memory_bytes -= entry.size;
        }
    }

    /// Snapshot of hit/miss/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_lru(&self, inner: &mut CacheInner) {
        let Some((key, entry)) = inner.map.shift_remove_index(0) else {
            return;
        };
        inner.memory_bytes -= entry.size;
        let total = self.evictions.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(callback) = &self.on_evict {
            callback(key, &entry.episode);
        }
        self.sink.emit(Event::CacheEviction {
            cache_name: self.name,
            evicted_key: key.to_string(),
            size_bytes: entry.size,
            total_evictions: total,
            cache_size: inner.map.len(),
            memory_bytes: inner.memory_bytes,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn episode(id: u64) -> Episode {
        Episode {
            episode_id: id,
            query_text: format!("q{id}"),
            answer_text: format!("a{id}"),
            query_chunk_embeddings: vec![vec![0.1; 8]],
            answer_chunk_embeddings: vec![vec![0.2; 8]],
            created_at: 0,
            metadata: None,
        }
    }

    #[test]
    fn lru_order_with_refresh() {
        // max_size = 3: set a, b, c; get(a); set d  =>  {a, c, d}.
        let cache = EpisodeCache::new(3, None, EventSink::new());
        cache.set(1, episode(1)); // a
        cache.set(2, episode(2)); // b
        cache.set(3, episode(3)); // c
        assert!(cache.get(1).is_some()); // refresh a
        cache.set(4, episode(4)); // d evicts b

        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_none());
        assert!(cache.peek(3).is_some());
        assert!(cache.peek(4).is_some());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn peek_does_not_refresh() {
        let cache = EpisodeCache::new(2, None, EventSink::new());
        cache.set(1, episode(1));
        cache.set(2, episode(2));
        assert!(cache.peek(1).is_some());
        cache.set(3, episode(3)); // evicts 1 despite the peek

        assert!(cache.peek(1).is_none());
        assert!(cache.peek(2).is_some());
    }

    #[test]
    fn memory_cap_holds_after_set() {
        let size = episode(0).approximate_size();
        let cap = size * 2 + size / 2; // room for two entries only
        let cache = EpisodeCache::new(100, Some(cap), EventSink::new());

        for id in 0..10 {
            cache.set(id, episode(id));
            assert!(cache.memory_bytes() <= cap);
            assert!(cache.len() <= 2);
        }
        assert!(cache.stats().evictions >= 8);
    }

    #[test]
    fn oversized_entry_is_not_cached() {
        let cache = EpisodeCache::new(10, Some(16), EventSink::new());
        cache.set(1, episode(1));
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn replacing_a_key_adjusts_accounting() {
        let cache = EpisodeCache::new(10, None, EventSink::new());
        cache.set(1, episode(1));
        let before = cache.memory_bytes();
        cache.set(1, episode(1));
        assert_eq!(cache.memory_bytes(), before);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_callback_and_event_fire() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted);
        let (sink, rx) = EventSink::with_channel(16);

        let cache = EpisodeCache::new(1, None, sink).with_eviction_callback(Box::new(
            move |_key, _episode| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        cache.set(1, episode(1));
        cache.set(2, episode(2));

        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        let event = rx.try_recv().unwrap();
        match event {
            Event::CacheEviction {
                evicted_key,
                total_evictions,
                cache_size,
                ..
            } => {
                assert_eq!(evicted_key, "1");
                assert_eq!(total_evictions, 1);
                assert_eq!(cache_size, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn hit_rate_tracks_lookups() {
        let cache = EpisodeCache::new(4, None, EventSink::new());
        cache.set(1, episode(1));
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }
}
