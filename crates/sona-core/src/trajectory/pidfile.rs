//! Best-effort single-writer lock via a PID file.
//!
//! The writer drops `memory-server.pid` into the storage directory. A
//! second read-write open checks the file: a live owning process means
//! [`Error::MultiProcessConflict`]; a dead one means the file is stale and
//! is replaced. Read-only opens never look at the file, so concurrent
//! readers are always allowed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name used for the writer lock.
pub(super) const PID_FILE_NAME: &str = "memory-server.pid";

/// Contents of the PID file. The `address` field doubles as service
/// discovery for IPC readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidFile {
    /// Owning process id.
    pub pid: u32,
    /// Host name the owner runs on.
    pub host: String,
    /// Advertised service address.
    pub address: String,
    /// Owner start time (Unix seconds).
    pub start_time: i64,
}

/// Held writer lock; the PID file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquires the writer lock for `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MultiProcessConflict`] when another live process
    /// holds the file, or an IO error when the file cannot be written.
    pub fn acquire(dir: &Path, address: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io("create trajectory dir", e))?;
        let path = dir.join(PID_FILE_NAME);

        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(existing) = serde_json::from_slice::<PidFile>(&bytes) {
                if existing.pid != std::process::id() && process_alive(existing.pid) {
                    return Err(Error::MultiProcessConflict {
                        pid: existing.pid,
                        path: dir.display().to_string(),
                    });
                }
                tracing::warn!(
                    stale_pid = existing.pid,
                    "replacing stale trajectory writer lock"
                );
            }
        }

        let contents = PidFile {
            pid: std::process::id(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            address: address.to_string(),
            start_time: now(),
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&contents)?)
            .map_err(|e| Error::io("write pid file", e))?;

        Ok(Self { path })
    }

    /// Reads the PID file without taking the lock (reader-side discovery).
    ///
    /// # Errors
    ///
    /// Fails when the file is absent or unparsable.
    pub fn read(dir: &Path) -> Result<PidFile> {
        let path = dir.join(PID_FILE_NAME);
        let bytes = std::fs::read(&path).map_err(|e| Error::io("read pid file", e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, treat any recorded owner as
    // alive; stale locks must be removed by the operator.
    true
}
