//! Bounded-concurrency point reader over the trajectory logs.
//!
//! At most `max_concurrent_queries` lookups touch the disk at once;
//! additional callers wait on the semaphore. Decoded records land in a
//! small LRU so hot trajectories skip the disk entirely.

use super::index::IndexEntry;
use super::log;
use super::Trajectory;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug)]
pub(super) struct DiskReader {
    dir: PathBuf,
    semaphore: Arc<Semaphore>,
    cache: Mutex<IndexMap<u64, Trajectory>>,
    cache_capacity: usize,
}

impl DiskReader {
    pub(super) fn new(dir: PathBuf, max_concurrent: usize, cache_capacity: usize) -> Self {
        Self {
            dir,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cache: Mutex::new(IndexMap::new()),
            cache_capacity: cache_capacity.max(1),
        }
    }

    /// Reads one trajectory through the cache and the concurrency gate.
    pub(super) async fn read(&self, id: u64, entry: &IndexEntry) -> Result<Trajectory> {
        if let Some(hit) = self.cache_get(id) {
            return Ok(hit);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed("trajectory reader"))?;

        let path = self.dir.join(&entry.file_path);
        let offset = entry.file_offset;
        let trajectory = tokio::task::spawn_blocking(move || {
            let result = log::read_record_at(&path, offset);
            drop(permit);
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("reader task join error: {e}")))??;

        self.cache_put(id, trajectory.clone());
        Ok(trajectory)
    }

    fn cache_get(&self, id: u64) -> Option<Trajectory> {
        let mut cache = self.cache.lock();
        if let Some(hit) = cache.shift_remove(&id) {
            let clone = hit.clone();
            cache.insert(id, hit);
            Some(clone)
        } else {
            None
        }
    }

    fn cache_put(&self, id: u64, trajectory: Trajectory) {
        let mut cache = self.cache.lock();
        cache.shift_remove(&id);
        while cache.len() >= self.cache_capacity {
            cache.shift_remove_index(0);
        }
        cache.insert(id, trajectory);
    }

    /// Drops a cached record (after a metadata update).
    pub(super) fn invalidate(&self, id: u64) {
        self.cache.lock().shift_remove(&id);
    }
}
