//! Error types for SONA.
//!
//! This module provides a unified error type for all SONA operations.
//! Error codes follow the pattern `SONA-XXX` for easy debugging, and every
//! variant carries enough context to name the failing operation.

use thiserror::Error;

/// Result type alias for SONA operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SONA operations.
///
/// Each variant includes a descriptive error message suitable for end-users.
/// The split between transient and structural errors drives the retry policy:
/// transient errors may be retried with backoff, structural errors never are.
#[derive(Error, Debug)]
pub enum Error {
    /// Vector dimension mismatch (SONA-001).
    #[error("[SONA-001] Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Append-only invariant violated (SONA-002).
    ///
    /// Episodes, outcomes and trajectory metadata are append-only; delete and
    /// clear are rejected without touching store state.
    #[error("[SONA-002] Append-only violation: '{operation}' is forbidden on {store} (rows may only be purged by off-path compaction with explicit approval)")]
    AppendOnlyViolation {
        /// Store the operation was attempted on.
        store: &'static str,
        /// The forbidden operation.
        operation: &'static str,
    },

    /// Another writer process holds the storage directory (SONA-003).
    #[error("[SONA-003] Another writer (pid {pid}) holds the lock on {path}")]
    MultiProcessConflict {
        /// PID recorded in the lock file.
        pid: u32,
        /// Storage directory path.
        path: String,
    },

    /// Rollback re-attempted without progress (SONA-004).
    #[error("[SONA-004] Rollback loop: checkpoint '{checkpoint_id}' was already rolled back and no progress has been made since")]
    RollbackLoop {
        /// The checkpoint that was re-rolled.
        checkpoint_id: String,
    },

    /// Attempt to delete the baseline checkpoint (SONA-005).
    #[error("[SONA-005] Baseline checkpoint '{0}' cannot be deleted")]
    DeleteBaseline(String),

    /// Write attempted on a read-only handle (SONA-006).
    #[error("[SONA-006] Store is read-only: {0}")]
    ReadOnly(String),

    /// A deadline was exceeded (SONA-007).
    #[error("[SONA-007] Timeout in '{operation}' after {elapsed_ms}ms (budget {budget_ms}ms)")]
    TimeoutExceeded {
        /// Operation that timed out.
        operation: String,
        /// Elapsed time in milliseconds.
        elapsed_ms: u64,
        /// Configured budget in milliseconds.
        budget_ms: u64,
    },

    /// Every fusion source failed or timed out (SONA-008).
    #[error("[SONA-008] All search sources failed: {0}")]
    AllSourcesFailed(String),

    /// A pipeline step failed its quality gate (SONA-009).
    #[error("[SONA-009] Quality gate failed at step '{step}': score {score:.3} below threshold {threshold:.3}")]
    QualityGateFailed {
        /// Step (agent) name.
        step: String,
        /// Observed quality score.
        score: f32,
        /// Configured threshold.
        threshold: f32,
    },

    /// Read-back verification after a store did not match (SONA-010).
    #[error("[SONA-010] Write verification failed for key '{key}': stored content hash differs from read-back")]
    WriteVerificationFailed {
        /// Memory key whose read-back mismatched.
        key: String,
    },

    /// Log migration could not be completed (SONA-011).
    #[error("[SONA-011] Migration failed: {0}")]
    MigrationFailed(String),

    /// Operation on a closed component (SONA-012).
    #[error("[SONA-012] {0} is closed")]
    Closed(&'static str),

    /// Invalid caller-supplied input (SONA-013).
    #[error("[SONA-013] Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (SONA-014).
    #[error("[SONA-014] Configuration error: {0}")]
    Config(String),

    /// IO error (SONA-015).
    #[error("[SONA-015] IO error during '{operation}': {source}")]
    Io {
        /// Operation that performed the IO.
        operation: &'static str,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error (SONA-016).
    #[error("[SONA-016] Serialization error: {0}")]
    Serialization(String),

    /// On-disk data failed validation (SONA-017).
    ///
    /// Indicates a corrupted log, index or snapshot that needs rebuilding.
    #[error("[SONA-017] Corrupted data: {0}")]
    Corrupted(String),

    /// A required record was not found (SONA-018).
    #[error("[SONA-018] Not found: {0}")]
    NotFound(String),

    /// Internal error (SONA-019).
    ///
    /// Indicates an unexpected internal error. Please report if encountered.
    #[error("[SONA-019] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "SONA-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "SONA-001",
            Self::AppendOnlyViolation { .. } => "SONA-002",
            Self::MultiProcessConflict { .. } => "SONA-003",
            Self::RollbackLoop { .. } => "SONA-004",
            Self::DeleteBaseline(_) => "SONA-005",
            Self::ReadOnly(_) => "SONA-006",
            Self::TimeoutExceeded { .. } => "SONA-007",
            Self::AllSourcesFailed(_) => "SONA-008",
            Self::QualityGateFailed { .. } => "SONA-009",
            Self::WriteVerificationFailed { .. } => "SONA-010",
            Self::MigrationFailed(_) => "SONA-011",
            Self::Closed(_) => "SONA-012",
            Self::InvalidInput(_) => "SONA-013",
            Self::Config(_) => "SONA-014",
            Self::Io { .. } => "SONA-015",
            Self::Serialization(_) => "SONA-016",
            Self::Corrupted(_) => "SONA-017",
            Self::NotFound(_) => "SONA-018",
            Self::Internal(_) => "SONA-019",
        }
    }

    /// Returns true if this error is transient and the operation may be
    /// retried with backoff.
    ///
    /// Structural errors (dimension mismatches, append-only violations,
    /// migration failures, corruption) are surfaced immediately and never
    /// retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TimeoutExceeded { .. } | Self::Io { .. } | Self::AllSourcesFailed(_)
        )
    }

    /// Convenience constructor wrapping an IO error with its operation name.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
