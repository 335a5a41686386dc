//! The trajectory stream facade.
//!
//! Ties the memory window, batched writer, binary log, index, PID lock and
//! rollback protocol together behind one handle. Writers are exclusive per
//! storage directory (PID file); readers are unlimited.

use super::index::TrajectoryIndex;
use super::log::{LogWriter, RollbackState};
use super::pidfile::PidLock;
use super::reader::DiskReader;
use super::window::MemoryWindow;
use super::{Trajectory, TrajectoryStatus};
use crate::config::TrajectoryConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Aggregate stream statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Trajectories on disk (indexed).
    pub persisted: usize,
    /// Trajectories queued for the next flush.
    pub queued: usize,
    /// Trajectories in the memory window.
    pub window: usize,
    /// Rollbacks recorded in the log.
    pub rollback_count: u32,
}

#[derive(Debug)]
struct Queue {
    entries: Vec<Trajectory>,
    oldest: Option<Instant>,
}

#[derive(Debug, Default)]
struct Progress {
    new_trajectory: bool,
    new_checkpoint: bool,
    weight_changed: bool,
}

impl Progress {
    fn any(&self) -> bool {
        self.new_trajectory || self.new_checkpoint || self.weight_changed
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct Checkpoints {
    known: FxHashSet<String>,
    baseline: Option<String>,
}

/// Bounded in-memory window plus batched on-disk writer with a versioned
/// binary log, a multi-process writer lock and a loop-detecting rollback
/// protocol.
#[derive(Debug)]
pub struct TrajectoryStream {
    dir: PathBuf,
    config: TrajectoryConfig,
    read_only: bool,
    pid_lock: Mutex<Option<PidLock>>,
    window: Mutex<MemoryWindow>,
    queue: Mutex<Queue>,
    /// Serializes flushes; a blocked flusher re-checks the queue and
    /// becomes a no-op, coalescing concurrent flush requests.
    flush_lock: Mutex<()>,
    log: Option<Mutex<LogWriter>>,
    segment: String,
    index: TrajectoryIndex,
    reader: DiskReader,
    progress: Mutex<Progress>,
    checkpoints: Mutex<Checkpoints>,
    closed: AtomicBool,
}

impl TrajectoryStream {
    /// Opens the stream read-write under `<root>/sona/trajectories`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MultiProcessConflict`] when another live writer
    /// owns the directory, or a corruption error when the log fails
    /// validation.
    pub fn open<P: AsRef<Path>>(root: P, config: TrajectoryConfig) -> Result<Self> {
        Self::open_inner(root.as_ref(), config, false)
    }

    /// Opens the stream read-only. Never checks or takes the PID lock.
    ///
    /// # Errors
    ///
    /// Fails when the log cannot be scanned.
    pub fn open_read_only<P: AsRef<Path>>(root: P, config: TrajectoryConfig) -> Result<Self> {
        Self::open_inner(root.as_ref(), config, true)
    }

    fn open_inner(root: &Path, config: TrajectoryConfig, read_only: bool) -> Result<Self> {
        let dir = root.join("sona").join("trajectories");
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("create trajectory dir", e))?;

        let pid_lock = if read_only {
            None
        } else {
            Some(PidLock::acquire(&dir, "local")?)
        };

        let segment = latest_segment(&dir)?;
        let segment_path = dir.join(&segment);

        let log = if read_only {
            None
        } else {
            Some(Mutex::new(LogWriter::open_or_create(
                &segment_path,
                config.compress,
            )?))
        };

        let index = TrajectoryIndex::load(&dir);
        for existing in all_segments(&dir)? {
            let stats = super::log::peek_stats(&dir.join(&existing))?;
            if index.is_stale_for(&existing, stats.record_count) {
                tracing::info!(segment = %existing, "rebuilding stale trajectory index");
                if read_only {
                    index.rebuild_segment_volatile(&dir, &existing)?;
                } else {
                    index.rebuild_segment(&dir, &existing)?;
                }
            }
        }

        let reader = DiskReader::new(
            dir.clone(),
            config.max_concurrent_queries,
            config.reader_cache_size,
        );

        Ok(Self {
            window: Mutex::new(MemoryWindow::new(config.memory_window_size)),
            queue: Mutex::new(Queue {
                entries: Vec::new(),
                oldest: None,
            }),
            flush_lock: Mutex::new(()),
            log,
            segment,
            index,
            reader,
            progress: Mutex::new(Progress::default()),
            checkpoints: Mutex::new(Checkpoints::default()),
            closed: AtomicBool::new(false),
            pid_lock: Mutex::new(pid_lock),
            dir,
            config,
            read_only,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("trajectory stream"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(Error::ReadOnly(format!(
                "trajectory stream at {}",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn writer(&self) -> Result<&Mutex<LogWriter>> {
        self.log
            .as_ref()
            .ok_or_else(|| Error::ReadOnly(format!("trajectory stream at {}", self.dir.display())))
    }

    /// Appends a trajectory: into the window immediately, onto the disk
    /// queue for the next batch flush.
    ///
    /// # Errors
    ///
    /// Fails on invalid quality scores, read-only handles, or when the
    /// triggered batch flush fails.
    pub fn add(&self, trajectory: Trajectory) -> Result<()> {
        self.ensure_writable()?;
        trajectory.validate()?;

        self.window.lock().insert(trajectory.clone(), now());
        self.progress.lock().new_trajectory = true;

        let should_flush = {
            let mut queue = self.queue.lock();
            queue.entries.push(trajectory);
            if queue.oldest.is_none() {
                queue.oldest = Some(Instant::now());
            }
            queue.entries.len() >= self.config.batch_write_size
        };

        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes all queued trajectories to the log and the index.
    ///
    /// # Errors
    ///
    /// Fails on IO problems; queued entries stay in the window either way.
    pub fn flush(&self) -> Result<()> {
        self.ensure_writable()?;
        let _serialize = self.flush_lock.lock();

        let batch = {
            let mut queue = self.queue.lock();
            queue.oldest = None;
            std::mem::take(&mut queue.entries)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut log = self.writer()?.lock();
        let locations = log.append_batch(&batch)?;
        self.index
            .register_batch(&self.segment, &batch, &locations, log.record_count())?;

        tracing::debug!(records = batch.len(), "trajectory batch flushed");
        Ok(())
    }

    /// Flushes when the oldest queued entry has waited past the batch
    /// interval. Called by the background flusher.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::flush`].
    pub fn flush_if_due(&self) -> Result<()> {
        let due = {
            let queue = self.queue.lock();
            queue.oldest.is_some_and(|oldest| {
                oldest.elapsed().as_millis() as u64 >= self.config.batch_write_interval_ms
            })
        };
        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Spawns the interval flusher. The task exits when the stream closes.
    pub fn start_background_flush(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stream = Arc::clone(self);
        let period =
            std::time::Duration::from_millis((stream.config.batch_write_interval_ms / 2).max(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if stream.closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = stream.flush_if_due() {
                    tracing::warn!(error = %e, "interval flush failed");
                }
            }
        })
    }

    /// Point lookup: memory window first, then the disk log through the
    /// bounded reader.
    ///
    /// # Errors
    ///
    /// Fails when the indexed record cannot be read back.
    pub async fn get(&self, id: u64) -> Result<Option<Trajectory>> {
        self.ensure_open()?;

        if let Some(hit) = self.window.lock().get(id).cloned() {
            return Ok(Some(hit));
        }

        let Some(entry) = self.index.get(id) else {
            return Ok(None);
        };
        self.reader.read(id, &entry).await.map(Some)
    }

    /// Updates the mutable metadata of a stored trajectory: `status`,
    /// `quality_score` and `completed_at`. All other fields are frozen.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids, invalid scores or read-only handles.
    pub fn update_status(
        &self,
        id: u64,
        status: TrajectoryStatus,
        quality_score: f32,
        completed_at: Option<i64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        if !(0.0..=1.0).contains(&quality_score) {
            return Err(Error::InvalidInput(format!(
                "quality score {quality_score} outside [0, 1]"
            )));
        }

        // Queued rows must reach the index before their metadata can move.
        self.flush()?;

        if let Some(entry) = self.window.lock().get_mut(id) {
            entry.status = status;
            entry.quality_score = quality_score;
            entry.completed_at = completed_at;
        }

        self.index
            .update_mutable(id, status, quality_score, completed_at)?;
        self.reader.invalidate(id);
        Ok(())
    }

    /// Registers a checkpoint id. The first one becomes the baseline and
    /// can never be deleted.
    ///
    /// # Errors
    ///
    /// Fails on read-only handles.
    pub fn register_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut checkpoints = self.checkpoints.lock();
        if checkpoints.baseline.is_none() {
            checkpoints.baseline = Some(checkpoint_id.to_string());
        }
        checkpoints.known.insert(checkpoint_id.to_string());
        self.progress.lock().new_checkpoint = true;
        Ok(())
    }

    /// Deletes a checkpoint id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeleteBaseline`] for the baseline checkpoint and
    /// [`Error::NotFound`] for unknown ids.
    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut checkpoints = self.checkpoints.lock();
        if checkpoints.baseline.as_deref() == Some(checkpoint_id) {
            return Err(Error::DeleteBaseline(checkpoint_id.to_string()));
        }
        if !checkpoints.known.remove(checkpoint_id) {
            return Err(Error::NotFound(format!("checkpoint '{checkpoint_id}'")));
        }
        Ok(())
    }

    /// Marks routing-weight movement for rollback-progress tracking.
    /// Changes above 1 % magnitude count as progress.
    pub fn note_weight_change(&self, magnitude: f32) {
        if magnitude.abs() > 0.01 {
            self.progress.lock().weight_changed = true;
        }
    }

    /// Records a rollback to `checkpoint_id`.
    ///
    /// Re-rolling the same checkpoint fails with [`Error::RollbackLoop`]
    /// unless progress happened since: a new trajectory, a new checkpoint,
    /// or a routing weight moved by more than 1 %.
    ///
    /// # Errors
    ///
    /// Also fails for unknown checkpoints and read-only handles.
    pub fn record_rollback(&self, checkpoint_id: &str) -> Result<()> {
        self.ensure_writable()?;
        if !self.checkpoints.lock().known.contains(checkpoint_id) {
            return Err(Error::NotFound(format!("checkpoint '{checkpoint_id}'")));
        }

        let mut log = self.writer()?.lock();
        let state = log.rollback_state().clone();

        let repeated = state.last_rollback_checkpoint_id.as_deref() == Some(checkpoint_id);
        if repeated && !self.progress.lock().any() {
            return Err(Error::RollbackLoop {
                checkpoint_id: checkpoint_id.to_string(),
            });
        }

        log.set_rollback_state(RollbackState {
            last_rollback_checkpoint_id: Some(checkpoint_id.to_string()),
            last_rollback_at: Some(now()),
            rollback_count: state.rollback_count + 1,
        })?;
        self.progress.lock().reset();

        tracing::info!(checkpoint = checkpoint_id, "rollback recorded");
        Ok(())
    }

    /// Current rollback bookkeeping.
    ///
    /// # Errors
    ///
    /// Fails when a read-only handle cannot scan the log.
    pub fn rollback_state(&self) -> Result<RollbackState> {
        self.ensure_open()?;
        if let Some(log) = &self.log {
            return Ok(log.lock().rollback_state().clone());
        }
        let path = self.dir.join(&self.segment);
        if !path.exists() {
            return Ok(RollbackState::default());
        }
        Ok(super::log::scan_v2(&path)?.rollback)
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let rollback_count = self
            .log
            .as_ref()
            .map_or(0, |log| log.lock().rollback_state().rollback_count);
        StreamStats {
            persisted: self.index.len(),
            queued: self.queue.lock().entries.len(),
            window: self.window.lock().len(),
            rollback_count,
        }
    }

    /// Metadata listing straight from the index.
    #[must_use]
    pub fn list(&self) -> Vec<(u64, super::index::IndexEntry)> {
        self.index.list()
    }

    /// Storage directory of this stream.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flushes pending work and releases the writer lock. Subsequent
    /// operations fail with a typed closed error.
    ///
    /// # Errors
    ///
    /// Fails when the final flush fails; the stream still closes.
    pub fn close(&self) -> Result<()> {
        self.ensure_open()?;
        let result = if self.read_only { Ok(()) } else { self.flush() };
        self.closed.store(true, Ordering::Release);
        self.pid_lock.lock().take();
        result
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Highest-numbered `trajectories-<n>.log`, or the first segment name.
fn latest_segment(dir: &Path) -> Result<String> {
    Ok(all_segments(dir)?
        .into_iter()
        .last()
        .unwrap_or_else(|| "trajectories-0.log".to_string()))
}

fn all_segments(dir: &Path) -> Result<Vec<String>> {
    let mut segments: Vec<(u32, String)> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io("list trajectory dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("list trajectory dir", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(n) = name
            .strip_prefix("trajectories-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            segments.push((n, name));
        }
    }
    segments.sort_unstable();
    Ok(segments.into_iter().map(|(_, name)| name).collect())
}
