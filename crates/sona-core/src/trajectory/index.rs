//! JSON index over the binary trajectory logs.
//!
//! Maps `trajectory_id` to its physical location plus the metadata columns
//! used for listing without touching the log. The log is the source of
//! truth: a missing or stale index is rebuilt by a full scan.

use super::log;
use super::{Trajectory, TrajectoryStatus};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One indexed trajectory: location plus metadata columns.
///
/// `file_path`, `file_offset` and `file_length` are immutable after
/// insert; only `status`, `quality_score` and `completed_at` may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Log segment file name.
    pub file_path: String,
    /// Record offset in the segment.
    pub file_offset: u64,
    /// Record byte length.
    pub file_length: u64,
    /// Route column.
    pub route: String,
    /// Step-count column.
    pub step_count: u32,
    /// Quality-score column.
    pub quality_score: f32,
    /// Creation timestamp column.
    pub created_at: i64,
    /// Completion timestamp column.
    pub completed_at: Option<i64>,
    /// Status column.
    pub status: TrajectoryStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    /// Record count per segment at the time the index was written; used
    /// for staleness detection.
    segments: BTreeMap<String, u32>,
    entries: BTreeMap<u64, IndexEntry>,
}

/// In-memory index with JSON persistence (`index.json`).
#[derive(Debug)]
pub struct TrajectoryIndex {
    path: PathBuf,
    inner: RwLock<IndexFile>,
}

impl TrajectoryIndex {
    /// Loads `index.json` from `dir`, or starts empty when absent or
    /// unreadable (the caller decides whether to rebuild).
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("index.json");
        let inner = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    /// True when the index disagrees with a segment's header record count.
    #[must_use]
    pub fn is_stale_for(&self, segment: &str, actual_record_count: u32) -> bool {
        self.inner
            .read()
            .segments
            .get(segment)
            .copied()
            .unwrap_or(0)
            != actual_record_count
    }

    /// Rebuilds the index for one segment from a full log scan.
    ///
    /// # Errors
    ///
    /// Fails when the segment cannot be scanned or the index cannot be
    /// persisted.
    pub fn rebuild_segment(&self, dir: &Path, segment: &str) -> Result<()> {
        self.rebuild_inner(dir, segment, true)
    }

    /// Rebuilds one segment without persisting, for read-only opens.
    ///
    /// # Errors
    ///
    /// Fails when the segment cannot be scanned.
    pub fn rebuild_segment_volatile(&self, dir: &Path, segment: &str) -> Result<()> {
        self.rebuild_inner(dir, segment, false)
    }

    fn rebuild_inner(&self, dir: &Path, segment: &str, persist: bool) -> Result<()> {
        let scan = log::scan_v2(&dir.join(segment))?;
        let mut inner = self.inner.write();

        inner.entries.retain(|_, e| e.file_path != segment);
        for record in &scan.records {
            inner.entries.insert(
                record.trajectory.trajectory_id,
                entry_for(segment, record.offset, record.byte_len, &record.trajectory),
            );
        }
        inner.segments.insert(segment.to_string(), scan.stats.record_count);
        if persist {
            Self::persist(&self.path, &inner)?;
        }
        Ok(())
    }

    /// Registers freshly appended records.
    ///
    /// # Errors
    ///
    /// Fails when the index cannot be persisted.
    pub fn register_batch(
        &self,
        segment: &str,
        batch: &[Trajectory],
        locations: &[(u64, u64)],
        segment_record_count: u32,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        for (trajectory, &(offset, length)) in batch.iter().zip(locations) {
            inner.entries.insert(
                trajectory.trajectory_id,
                entry_for(segment, offset, length, trajectory),
            );
        }
        inner
            .segments
            .insert(segment.to_string(), segment_record_count);
        Self::persist(&self.path, &inner)
    }

    /// Point lookup.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<IndexEntry> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// True when the id is indexed.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    /// Number of indexed trajectories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates the mutable metadata columns of one entry.
    ///
    /// # Errors
    ///
    /// Fails when the id is unknown or the index cannot be persisted.
    /// The location columns are never touched.
    pub fn update_mutable(
        &self,
        id: u64,
        status: TrajectoryStatus,
        quality_score: f32,
        completed_at: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("trajectory {id}")))?;
        entry.status = status;
        entry.quality_score = quality_score;
        entry.completed_at = completed_at;
        Self::persist(&self.path, &inner)
    }

    /// All metadata rows, ordered by trajectory id.
    #[must_use]
    pub fn list(&self) -> Vec<(u64, IndexEntry)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(&id, e)| (id, e.clone()))
            .collect()
    }

    fn persist(path: &Path, inner: &IndexFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(inner)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| Error::io("write index.json", e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::io("rename index.json", e))?;
        Ok(())
    }
}

fn entry_for(segment: &str, offset: u64, length: u64, trajectory: &Trajectory) -> IndexEntry {
    IndexEntry {
        file_path: segment.to_string(),
        file_offset: offset,
        file_length: length,
        route: trajectory.route.clone(),
        step_count: trajectory.step_count,
        quality_score: trajectory.quality_score,
        created_at: trajectory.created_at,
        completed_at: trajectory.completed_at,
        status: trajectory.status,
    }
}
