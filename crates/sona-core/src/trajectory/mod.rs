//! Trajectory streaming: bounded memory window, batched disk writer,
//! versioned binary log, JSON index and the rollback protocol.
//!
//! A trajectory is an ordered record of one agent execution. Metadata is
//! append-only: after insert only `status`, `quality_score` and
//! `completed_at` may change; the id and file-reference fields are frozen.
//!
//! # Module Organization
//!
//! - `log`: binary log v2 codec (`TRAJ` magic, CRC32, LZ4 records)
//! - `window`: quality-weighted in-memory window
//! - `index`: JSON index (`trajectory_id` -> file/offset/length + metadata)
//! - `pidfile`: best-effort single-writer lock
//! - `reader`: bounded-concurrency disk reader with a record cache
//! - `migrate`: v1 <-> v2 log migration
//! - `manager`: the [`TrajectoryStream`] facade: batched single-writer
//!   queue, flush coalescing and the rollback protocol

mod index;
mod log;
mod manager;
mod migrate;
mod pidfile;
mod reader;
mod window;

pub use index::{IndexEntry, TrajectoryIndex};
pub use log::{LogStats, RollbackState, LOG_VERSION_V1, LOG_VERSION_V2};
pub use manager::TrajectoryStream;
pub use migrate::{migrate_to_version, MigrationOptions, MigrationReport};
pub use pidfile::{PidFile, PidLock};
pub use window::MemoryWindow;


use serde::{Deserialize, Serialize};

/// Lifecycle status of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    /// The agent run is still in flight.
    InProgress,
    /// The run finished and was scored.
    Completed,
    /// The run failed.
    Failed,
}

/// An ordered record of one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique id.
    pub trajectory_id: u64,
    /// Route the task was dispatched on.
    pub route: String,
    /// Number of executed steps.
    pub step_count: u32,
    /// Quality score in [0, 1].
    pub quality_score: f32,
    /// Creation timestamp (Unix seconds).
    pub created_at: i64,
    /// Completion timestamp, if finished.
    pub completed_at: Option<i64>,
    /// Lifecycle status.
    pub status: TrajectoryStatus,
    /// Optional structured payload (step traces).
    pub payload: Option<serde_json::Value>,
}

impl Trajectory {
    /// Validates the quality-score range.
    ///
    /// # Errors
    ///
    /// Returns an invalid-input error when the score leaves [0, 1].
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(crate::error::Error::InvalidInput(format!(
                "quality score {} outside [0, 1]",
                self.quality_score
            )));
        }
        Ok(())
    }
}
