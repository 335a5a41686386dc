//! Trajectory log migration between format versions.
//!
//! A migration decodes every record with the source-version decoder,
//! re-encodes with the target-version encoder into a temp file, verifies
//! the temp file by a full validating re-scan, then atomically renames it
//! over the original. The source file is backed up first by default.

use super::log::{self, LOG_VERSION_V1, LOG_VERSION_V2};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Options controlling a migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Copy the source file to `<name>.bak` before replacing it.
    pub backup: bool,
    /// Report the outcome without writing anything.
    pub dry_run: bool,
    /// LZ4-compress record payloads (v2 targets only).
    pub compress: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            backup: true,
            dry_run: false,
            compress: true,
        }
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version the log was read as.
    pub from_version: u32,
    /// Version the log was written as.
    pub to_version: u32,
    /// Records carried over.
    pub record_count: usize,
    /// File size before.
    pub bytes_before: u64,
    /// File size after (projected size on a dry run).
    pub bytes_after: u64,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Backup location, when one was written.
    pub backup_path: Option<PathBuf>,
}

/// Migrates one log file to `target` version.
///
/// # Errors
///
/// Returns [`Error::MigrationFailed`] when the source cannot be decoded,
/// the rewritten file fails verification, or the rename fails. A failed
/// migration never replaces the source file.
pub fn migrate_to_version(
    path: &Path,
    target: u32,
    options: &MigrationOptions,
) -> Result<MigrationReport> {
    let stats = log::peek_stats(path)
        .map_err(|e| Error::MigrationFailed(format!("cannot read source header: {e}")))?;

    if !matches!(target, LOG_VERSION_V1 | LOG_VERSION_V2) {
        return Err(Error::MigrationFailed(format!(
            "unknown target version {target}"
        )));
    }

    let scan = match stats.version {
        LOG_VERSION_V1 => log::scan_v1(path),
        LOG_VERSION_V2 => log::scan_v2(path),
        other => Err(Error::MigrationFailed(format!(
            "unknown source version {other}"
        ))),
    }
    .map_err(|e| Error::MigrationFailed(format!("source scan failed: {e}")))?;

    let records: Vec<_> = scan.records.iter().map(|r| r.trajectory.clone()).collect();

    let encoded = match target {
        LOG_VERSION_V1 => log::encode_v1_file(&records)?,
        _ => log::encode_v2_file(&records, &scan.rollback, options.compress)?,
    };

    let report = MigrationReport {
        from_version: stats.version,
        to_version: target,
        record_count: records.len(),
        bytes_before: stats.byte_len,
        bytes_after: encoded.len() as u64,
        dry_run: options.dry_run,
        backup_path: None,
    };

    if options.dry_run || stats.version == target {
        return Ok(report);
    }

    let backup_path = if options.backup {
        let backup = path.with_extension("log.bak");
        std::fs::copy(path, &backup)
            .map_err(|e| Error::MigrationFailed(format!("backup failed: {e}")))?;
        Some(backup)
    } else {
        None
    };

    let tmp = path.with_extension("log.migrate");
    std::fs::write(&tmp, &encoded)
        .map_err(|e| Error::MigrationFailed(format!("temp write failed: {e}")))?;

    // Verify the rewrite reproduces the record count and a valid checksum
    // before the original is replaced.
    let verify = match target {
        LOG_VERSION_V1 => log::scan_v1(&tmp),
        _ => log::scan_v2(&tmp),
    };
    match verify {
        Ok(v) if v.records.len() == records.len() => {}
        Ok(v) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::MigrationFailed(format!(
                "record count changed: {} -> {}",
                records.len(),
                v.records.len()
            )));
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::MigrationFailed(format!(
                "verification scan failed: {e}"
            )));
        }
    }

    std::fs::rename(&tmp, path)
        .map_err(|e| Error::MigrationFailed(format!("atomic rename failed: {e}")))?;

    tracing::info!(
        from = report.from_version,
        to = report.to_version,
        records = report.record_count,
        "trajectory log migrated"
    );

    Ok(MigrationReport {
        backup_path,
        ..report
    })
}

#[cfg(test)]
mod tests {
    use super::super::{Trajectory, TrajectoryStatus};
    use super::*;

    fn trajectory(id: u64) -> Trajectory {
        Trajectory {
            trajectory_id: id,
            route: "researcher".into(),
            step_count: 4,
            quality_score: 0.7,
            created_at: 1_700_000_000,
            completed_at: None,
            status: TrajectoryStatus::InProgress,
            payload: Some(serde_json::json!({"notes": "retrieval pass"})),
        }
    }

    fn write_v1(dir: &Path, n: u64) -> PathBuf {
        let records: Vec<Trajectory> = (0..n).map(trajectory).collect();
        let path = dir.join("trajectories-0.log");
        std::fs::write(&path, log::encode_v1_file(&records).unwrap()).unwrap();
        path
    }

    use std::path::Path;

    #[test]
    fn v1_to_v2_upgrade_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_v1(dir.path(), 6);

        let report =
            migrate_to_version(&path, LOG_VERSION_V2, &MigrationOptions::default()).unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.to_version, 2);
        assert_eq!(report.record_count, 6);
        assert!(report.backup_path.as_ref().unwrap().exists());

        let scan = log::scan_v2(&path).unwrap();
        assert_eq!(scan.records.len(), 6);
        assert_eq!(scan.records[3].trajectory, trajectory(3));
    }

    #[test]
    fn v2_to_v1_downgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        let records: Vec<Trajectory> = (0..3).map(trajectory).collect();
        std::fs::write(
            &path,
            log::encode_v2_file(&records, &log::RollbackState::default(), true).unwrap(),
        )
        .unwrap();

        let options = MigrationOptions {
            backup: false,
            ..MigrationOptions::default()
        };
        let report = migrate_to_version(&path, LOG_VERSION_V1, &options).unwrap();
        assert_eq!(report.to_version, 1);
        assert!(report.backup_path.is_none());

        let scan = log::scan_v1(&path).unwrap();
        assert_eq!(scan.records.len(), 3);
    }

    #[test]
    fn dry_run_leaves_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_v1(dir.path(), 2);
        let before = std::fs::read(&path).unwrap();

        let options = MigrationOptions {
            dry_run: true,
            ..MigrationOptions::default()
        };
        let report = migrate_to_version(&path, LOG_VERSION_V2, &options).unwrap();
        assert!(report.dry_run);
        assert!(report.bytes_after > 0);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn same_version_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_v1(dir.path(), 2);
        let before = std::fs::read(&path).unwrap();

        let report =
            migrate_to_version(&path, LOG_VERSION_V1, &MigrationOptions::default()).unwrap();
        assert_eq!(report.from_version, report.to_version);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn corrupt_source_fails_without_touching_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_v1(dir.path(), 3);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err =
            migrate_to_version(&path, LOG_VERSION_V2, &MigrationOptions::default()).unwrap_err();
        assert_eq!(err.code(), "SONA-011");
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }
}
