//! Append-only episode persistence.
//!
//! `LogEpisodeStore` keeps episodes and outcome rows in `learning.db`, an
//! append-only log replayed into an in-memory offset index on open. Every
//! insert is a single buffered write; `flush()` drains the buffer and
//! fsyncs, making committed rows crash-safe.
//!
//! # Record framing (little-endian)
//!
//! ```text
//! [Marker: u8]   1 = episode, 2 = outcome
//! [Len: u32]     bincode payload length
//! [Payload]      bincode-encoded row
//! ```

use super::{Episode, Outcome};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const MARKER_EPISODE: u8 = 1;
const MARKER_OUTCOME: u8 = 2;

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of episodes.
    pub episode_count: usize,
    /// Number of outcome rows.
    pub outcome_count: usize,
}

/// DAO contract for the primary episode store.
///
/// `delete` and `clear` exist on the trait so callers get a structured
/// [`Error::AppendOnlyViolation`] instead of a missing method; the default
/// bodies reject unconditionally and implementations must not override
/// them with anything weaker.
pub trait EpisodeStore: Send + Sync {
    /// Appends an episode row.
    ///
    /// # Errors
    ///
    /// Fails on duplicate ids, dimension drift or IO problems.
    fn insert(&self, episode: &Episode) -> Result<()>;

    /// Point lookup by episode id.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed or the row cannot be read.
    fn find_by_id(&self, id: u64) -> Result<Option<Episode>>;

    /// All episodes in insertion order.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed or a row cannot be decoded.
    fn find_all(&self) -> Result<Vec<Episode>>;

    /// Number of episodes.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn count(&self) -> Result<usize>;

    /// True when the id is present.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn exists(&self, id: u64) -> Result<bool>;

    /// Appends an outcome row.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed or the write fails.
    fn record_outcome(&self, outcome: &Outcome) -> Result<()>;

    /// `successes / total` for one episode, `None` without outcomes.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn success_rate(&self, episode_id: u64) -> Result<Option<f32>>;

    /// Number of outcomes recorded for one episode.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn outcome_count(&self, episode_id: u64) -> Result<usize>;

    /// Batch success rates, one entry per requested id.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn success_rates(&self, ids: &[u64]) -> Result<Vec<(u64, Option<f32>)>> {
        ids.iter()
            .map(|&id| Ok((id, self.success_rate(id)?)))
            .collect()
    }

    /// Aggregate statistics.
    ///
    /// # Errors
    ///
    /// Fails when the store is closed.
    fn stats(&self) -> Result<StoreStats>;

    /// Episodes are append-only; delete always fails.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::AppendOnlyViolation`].
    fn delete(&self, _id: u64) -> Result<()> {
        Err(Error::AppendOnlyViolation {
            store: "episodes",
            operation: "delete",
        })
    }

    /// Episodes are append-only; clear always fails.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::AppendOnlyViolation`].
    fn clear(&self) -> Result<()> {
        Err(Error::AppendOnlyViolation {
            store: "episodes",
            operation: "clear",
        })
    }

    /// Makes all committed rows crash-safe.
    ///
    /// # Errors
    ///
    /// Fails when the flush or fsync fails.
    fn flush(&self) -> Result<()>;

    /// Flushes and releases resources; later operations fail with
    /// [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// Fails when the final flush fails.
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct OutcomeAggregate {
    successes: u32,
    total: u32,
}

struct StoreInner {
    writer: BufWriter<File>,
    reader: File,
    /// episode id -> offset of the Len field in the log.
    offsets: FxHashMap<u64, u64>,
    /// Insertion order, for `find_all`.
    order: Vec<u64>,
    outcomes: FxHashMap<u64, OutcomeAggregate>,
    outcome_rows: usize,
    next_id: u64,
}

/// Append-only episode store backed by `learning.db`.
pub struct LogEpisodeStore {
    path: PathBuf,
    dimension: usize,
    inner: RwLock<StoreInner>,
    closed: AtomicBool,
}

impl LogEpisodeStore {
    /// Opens or creates `learning.db` under `root`, replaying existing rows.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created, the log cannot be
    /// opened, or replay hits a corrupt record.
    pub fn open<P: AsRef<Path>>(root: P, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref()).map_err(|e| Error::io("create storage root", e))?;
        let path = root.as_ref().join("learning.db");

        let writer_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("open learning.db for append", e))?;

        let reader = File::open(&path).map_err(|e| Error::io("open learning.db for read", e))?;

        let mut inner = StoreInner {
            writer: BufWriter::new(writer_file),
            reader,
            offsets: FxHashMap::default(),
            order: Vec::new(),
            outcomes: FxHashMap::default(),
            outcome_rows: 0,
            next_id: 1,
        };
        Self::replay(&path, &mut inner)?;

        Ok(Self {
            path,
            dimension,
            inner: RwLock::new(inner),
            closed: AtomicBool::new(false),
        })
    }

    fn replay(path: &Path, inner: &mut StoreInner) -> Result<()> {
        let file = File::open(path).map_err(|e| Error::io("open learning.db for replay", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat learning.db", e))?
            .len();
        let mut reader = BufReader::new(file);
        let mut pos = 0u64;

        while pos < len {
            let mut marker = [0u8; 1];
            reader
                .read_exact(&mut marker)
                .map_err(|e| Error::io("read record marker", e))?;
            let mut len_bytes = [0u8; 4];
            reader
                .read_exact(&mut len_bytes)
                .map_err(|e| Error::io("read record length", e))?;
            let payload_len = u32::from_le_bytes(len_bytes) as usize;

            let mut payload = vec![0u8; payload_len];
            reader
                .read_exact(&mut payload)
                .map_err(|e| Error::io("read record payload", e))?;

            match marker[0] {
                MARKER_EPISODE => {
                    let episode: Episode = bincode::deserialize(&payload)?;
                    inner.offsets.insert(episode.episode_id, pos + 1);
                    inner.order.push(episode.episode_id);
                    inner.next_id = inner.next_id.max(episode.episode_id + 1);
                }
                MARKER_OUTCOME => {
                    let outcome: Outcome = bincode::deserialize(&payload)?;
                    let agg = inner.outcomes.entry(outcome.episode_id).or_default();
                    agg.total += 1;
                    if outcome.success {
                        agg.successes += 1;
                    }
                    inner.outcome_rows += 1;
                }
                other => {
                    return Err(Error::Corrupted(format!(
                        "unknown record marker {other} at offset {pos}"
                    )));
                }
            }

            pos += 1 + 4 + payload_len as u64;
        }

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("episode store"));
        }
        Ok(())
    }

    /// Next free monotonic episode id.
    #[must_use]
    pub fn next_episode_id(&self) -> u64 {
        self.inner.read().next_id
    }

    /// Path of the backing `learning.db` file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_record(inner: &mut StoreInner, marker: u8, payload: &[u8]) -> Result<u64> {
        let pos = inner
            .writer
            .get_ref()
            .metadata()
            .map_err(|e| Error::io("stat learning.db", e))?
            .len()
            + inner.writer.buffer().len() as u64;

        let len = u32::try_from(payload.len())
            .map_err(|_| Error::InvalidInput("episode row exceeds 4 GiB".into()))?;

        let mut record = Vec::with_capacity(1 + 4 + payload.len());
        record.push(marker);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);
        inner
            .writer
            .write_all(&record)
            .map_err(|e| Error::io("append record", e))?;

        Ok(pos)
    }

    fn read_episode_at(&self, inner: &StoreInner, offset: u64) -> Result<Episode> {
        let mut reader = inner.reader.try_clone().map_err(|e| Error::io("clone reader", e))?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seek episode row", e))?;

        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|e| Error::io("read episode length", e))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| Error::io("read episode payload", e))?;

        Ok(bincode::deserialize(&payload)?)
    }
}

impl EpisodeStore for LogEpisodeStore {
    fn insert(&self, episode: &Episode) -> Result<()> {
        self.ensure_open()?;
        episode.validate(self.dimension)?;

        let mut inner = self.inner.write();
        if inner.offsets.contains_key(&episode.episode_id) {
            return Err(Error::InvalidInput(format!(
                "episode {} already exists",
                episode.episode_id
            )));
        }

        let payload = bincode::serialize(episode)?;
        let pos = Self::append_record(&mut inner, MARKER_EPISODE, &payload)?;
        // Flush the buffer so the reader handle can observe the row.
        inner
            .writer
            .flush()
            .map_err(|e| Error::io("flush after insert", e))?;

        inner.offsets.insert(episode.episode_id, pos + 1);
        inner.order.push(episode.episode_id);
        inner.next_id = inner.next_id.max(episode.episode_id + 1);
        Ok(())
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Episode>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let Some(&offset) = inner.offsets.get(&id) else {
            return Ok(None);
        };
        self.read_episode_at(&inner, offset).map(Some)
    }

    fn find_all(&self) -> Result<Vec<Episode>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .map(|id| {
                let offset = inner.offsets[id];
                self.read_episode_at(&inner, offset)
            })
            .collect()
    }

    fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.inner.read().order.len())
    }

    fn exists(&self, id: u64) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.inner.read().offsets.contains_key(&id))
    }

    fn record_outcome(&self, outcome: &Outcome) -> Result<()> {
        self.ensure_open()?;
        if let Some(quality) = outcome.quality {
            if !(0.0..=1.0).contains(&quality) {
                return Err(Error::InvalidInput(format!(
                    "outcome quality {quality} outside [0, 1]"
                )));
            }
        }

        let mut inner = self.inner.write();
        let payload = bincode::serialize(outcome)?;
        Self::append_record(&mut inner, MARKER_OUTCOME, &payload)?;
        inner
            .writer
            .flush()
            .map_err(|e| Error::io("flush after outcome", e))?;

        let agg = inner.outcomes.entry(outcome.episode_id).or_default();
        agg.total += 1;
        if outcome.success {
            agg.successes += 1;
        }
        inner.outcome_rows += 1;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn success_rate(&self, episode_id: u64) -> Result<Option<f32>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(inner.outcomes.get(&episode_id).and_then(|agg| {
            if agg.total == 0 {
                None
            } else {
                Some(agg.successes as f32 / agg.total as f32)
            }
        }))
    }

    fn outcome_count(&self, episode_id: u64) -> Result<usize> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(inner.outcomes.get(&episode_id).map_or(0, |agg| agg.total as usize))
    }

    fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(StoreStats {
            episode_count: inner.order.len(),
            outcome_count: inner.outcome_rows,
        })
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        inner
            .writer
            .flush()
            .map_err(|e| Error::io("flush learning.db", e))?;
        inner
            .writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io("fsync learning.db", e))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(id: u64, dim: usize) -> Episode {
        Episode {
            episode_id: id,
            query_text: format!("query {id}"),
            answer_text: format!("answer {id}"),
            query_chunk_embeddings: vec![vec![0.5; dim]],
            answer_chunk_embeddings: vec![vec![0.25; dim]],
            created_at: 1_700_000_000 + id as i64,
            metadata: Some(serde_json::json!({"route": "coder"})),
        }
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 8).unwrap();

        store.insert(&episode(1, 8)).unwrap();
        store.insert(&episode(2, 8)).unwrap();

        assert_eq!(store.count().unwrap(), 2);
        assert!(store.exists(1).unwrap());
        assert!(!store.exists(99).unwrap());

        let found = store.find_by_id(2).unwrap().unwrap();
        assert_eq!(found, episode(2, 8));
        assert!(store.find_by_id(99).unwrap().is_none());

        let all = store.find_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].episode_id, 1);
    }

    #[test]
    fn replay_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
            store.insert(&episode(1, 4)).unwrap();
            store.insert(&episode(7, 4)).unwrap();
            store
                .record_outcome(&Outcome {
                    episode_id: 7,
                    success: true,
                    quality: Some(0.9),
                    recorded_at: 0,
                })
                .unwrap();
            store.close().unwrap();
        }

        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.next_episode_id(), 8);
        assert_eq!(store.success_rate(7).unwrap(), Some(1.0));
        assert_eq!(store.outcome_count(7).unwrap(), 1);
        assert_eq!(store.find_by_id(7).unwrap().unwrap().query_text, "query 7");
    }

    #[test]
    fn delete_and_clear_are_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        store.insert(&episode(1, 4)).unwrap();

        let err = store.delete(1).unwrap_err();
        assert_eq!(err.code(), "SONA-002");
        assert!(err.to_string().contains("Append-only violation"));

        assert_eq!(store.clear().unwrap_err().code(), "SONA-002");

        // State untouched.
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.exists(1).unwrap());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        store.insert(&episode(5, 4)).unwrap();
        assert_eq!(store.insert(&episode(5, 4)).unwrap_err().code(), "SONA-013");
    }

    #[test]
    fn dimension_mismatch_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 16).unwrap();
        let err = store.insert(&episode(1, 8)).unwrap_err();
        assert_eq!(err.code(), "SONA-001");
        assert!(!err.is_transient());
    }

    #[test]
    fn closed_store_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        store.close().unwrap();

        assert_eq!(store.count().unwrap_err().code(), "SONA-012");
        assert_eq!(store.insert(&episode(1, 4)).unwrap_err().code(), "SONA-012");
        assert_eq!(store.flush().unwrap_err().code(), "SONA-012");
        assert_eq!(store.close().unwrap_err().code(), "SONA-012");
    }

    #[test]
    fn success_rates_aggregate_per_episode() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        store.insert(&episode(1, 4)).unwrap();

        for success in [true, true, false, true] {
            store
                .record_outcome(&Outcome {
                    episode_id: 1,
                    success,
                    quality: None,
                    recorded_at: 0,
                })
                .unwrap();
        }

        assert_eq!(store.success_rate(1).unwrap(), Some(0.75));
        assert_eq!(store.outcome_count(1).unwrap(), 4);
        assert_eq!(store.success_rate(2).unwrap(), None);

        let rates = store.success_rates(&[1, 2]).unwrap();
        assert_eq!(rates, vec![(1, Some(0.75)), (2, None)]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.episode_count, 1);
        assert_eq!(stats.outcome_count, 4);
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogEpisodeStore::open(dir.path(), 4).unwrap();
        let err = store
            .record_outcome(&Outcome {
                episode_id: 1,
                success: true,
                quality: Some(1.5),
                recorded_at: 0,
            })
            .unwrap_err();
        assert_eq!(err.code(), "SONA-013");
    }
}
