//! Versioned binary trajectory log.
//!
//! # Format v2 (all integers little-endian)
//!
//! ```text
//! Header (20 bytes):
//!   magic              : 4 bytes, ASCII "TRAJ"
//!   version            : u32 (= 2)
//!   trajectory_count   : u32
//!   checksum           : u32 (CRC32 of all record bytes)
//!   rollback_state_off : u32 (byte offset, 0 if absent)
//!
//! Records, length-prefixed:
//!   length  : u32 (bytes that follow)
//!   flags   : u8  (bit0 = LZ4 frame)
//!   payload : length - 1 bytes, JSON (plain or LZ4)
//!
//! Rollback state at rollback_state_off:
//!   JSON { last_rollback_checkpoint_id, last_rollback_at, rollback_count }
//! ```
//!
//! Format v1 is the legacy layout: a 16-byte header without the rollback
//! offset, and uncompressed records without the flags byte. It exists only
//! as a migration source/target.

use super::Trajectory;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Log magic bytes.
pub(super) const LOG_MAGIC: &[u8; 4] = b"TRAJ";
/// Legacy log version.
pub const LOG_VERSION_V1: u32 = 1;
/// Current log version.
pub const LOG_VERSION_V2: u32 = 2;

pub(super) const HEADER_LEN_V2: u64 = 20;
pub(super) const HEADER_LEN_V1: u64 = 16;
const FLAG_LZ4: u8 = 0b1;

/// Little-endian u32 at `offset`; callers bounds-check the slice first.
#[inline]
fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Persisted rollback bookkeeping (v2 only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackState {
    /// Checkpoint the last rollback targeted.
    pub last_rollback_checkpoint_id: Option<String>,
    /// Timestamp of the last rollback (Unix seconds).
    pub last_rollback_at: Option<i64>,
    /// Total rollbacks recorded in this log.
    pub rollback_count: u32,
}

/// Header-level facts about a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// Format version.
    pub version: u32,
    /// Records in the file.
    pub record_count: u32,
    /// CRC32 over the record region.
    pub checksum: u32,
    /// Total file length in bytes.
    pub byte_len: u64,
}

/// One decoded record plus its physical location.
#[derive(Debug, Clone)]
pub(super) struct ScannedRecord {
    pub offset: u64,
    pub byte_len: u64,
    pub trajectory: Trajectory,
}

/// Append-side handle over one v2 log segment.
///
/// The running CRC is kept in memory so a batch append only patches the
/// header instead of rescanning the record region.
pub(super) struct LogWriter {
    file: File,
    records_end: u64,
    count: u32,
    hasher: crc32fast::Hasher,
    rollback: RollbackState,
    compress: bool,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("records_end", &self.records_end)
            .field("count", &self.count)
            .field("rollback", &self.rollback)
            .field("compress", &self.compress)
            .finish()
    }
}

impl LogWriter {
    /// Opens an existing v2 segment or creates an empty one.
    pub(super) fn open_or_create(path: &Path, compress: bool) -> Result<Self> {
        let exists = path.exists()
            && std::fs::metadata(path)
                .map_err(|e| Error::io("stat trajectory log", e))?
                .len()
                > 0;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("open trajectory log", e))?;

        if !exists {
            let mut writer = Self {
                file,
                records_end: HEADER_LEN_V2,
                count: 0,
                hasher: crc32fast::Hasher::new(),
                rollback: RollbackState::default(),
                compress,
            };
            writer.rewrite_tail()?;
            return Ok(writer);
        }

        let scan = scan_v2(path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut record_bytes = vec![0u8; (scan.records_end - HEADER_LEN_V2) as usize];
        file.seek(SeekFrom::Start(HEADER_LEN_V2))
            .map_err(|e| Error::io("seek record region", e))?;
        file.read_exact(&mut record_bytes)
            .map_err(|e| Error::io("read record region", e))?;
        hasher.update(&record_bytes);

        Ok(Self {
            file,
            records_end: scan.records_end,
            count: scan.stats.record_count,
            hasher,
            rollback: scan.rollback,
            compress,
        })
    }

    pub(super) fn record_count(&self) -> u32 {
        self.count
    }

    pub(super) fn rollback_state(&self) -> &RollbackState {
        &self.rollback
    }

    /// Appends a batch of trajectories. Returns `(offset, byte_len)` per
    /// record, in input order.
    pub(super) fn append_batch(&mut self, batch: &[Trajectory]) -> Result<Vec<(u64, u64)>> {
        let mut locations = Vec::with_capacity(batch.len());
        let mut buffer = Vec::new();
        let mut offset = self.records_end;

        for trajectory in batch {
            let record = encode_record(trajectory, self.compress)?;
            locations.push((offset, record.len() as u64));
            offset += record.len() as u64;
            buffer.extend_from_slice(&record);
        }

        self.file
            .seek(SeekFrom::Start(self.records_end))
            .map_err(|e| Error::io("seek append position", e))?;
        self.file
            .write_all(&buffer)
            .map_err(|e| Error::io("append trajectory batch", e))?;

        self.hasher.update(&buffer);
        self.records_end = offset;
        self.count = u32::try_from(self.count as usize + batch.len())
            .map_err(|_| Error::InvalidInput("record count overflow".into()))?;

        self.rewrite_tail()?;
        Ok(locations)
    }

    /// Persists a new rollback state.
    pub(super) fn set_rollback_state(&mut self, state: RollbackState) -> Result<()> {
        self.rollback = state;
        self.rewrite_tail()
    }

    /// Rewrites the rollback state and header after the record region
    /// changed, then fsyncs.
    fn rewrite_tail(&mut self) -> Result<()> {
        let state_json = serde_json::to_vec(&self.rollback)?;
        let state_off = u32::try_from(self.records_end)
            .map_err(|_| Error::InvalidInput("trajectory log exceeds 4 GiB".into()))?;

        self.file
            .seek(SeekFrom::Start(self.records_end))
            .map_err(|e| Error::io("seek rollback state", e))?;
        self.file
            .write_all(&state_json)
            .map_err(|e| Error::io("write rollback state", e))?;
        self.file
            .set_len(self.records_end + state_json.len() as u64)
            .map_err(|e| Error::io("truncate log tail", e))?;

        let mut header = Vec::with_capacity(HEADER_LEN_V2 as usize);
        header.extend_from_slice(LOG_MAGIC);
        header.extend_from_slice(&LOG_VERSION_V2.to_le_bytes());
        header.extend_from_slice(&self.count.to_le_bytes());
        header.extend_from_slice(&self.hasher.clone().finalize().to_le_bytes());
        header.extend_from_slice(&state_off.to_le_bytes());

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io("seek header", e))?;
        self.file
            .write_all(&header)
            .map_err(|e| Error::io("write header", e))?;
        self.file
            .sync_all()
            .map_err(|e| Error::io("fsync trajectory log", e))?;
        Ok(())
    }
}

fn encode_record(trajectory: &Trajectory, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(trajectory)?;
    let (flags, payload) = if compress {
        (FLAG_LZ4, lz4_flex::compress_prepend_size(&json))
    } else {
        (0u8, json)
    };

    let length = u32::try_from(payload.len() + 1)
        .map_err(|_| Error::InvalidInput("trajectory payload exceeds 4 GiB".into()))?;

    let mut record = Vec::with_capacity(4 + 1 + payload.len());
    record.extend_from_slice(&length.to_le_bytes());
    record.push(flags);
    record.extend_from_slice(&payload);
    Ok(record)
}

fn decode_payload(flags: u8, payload: &[u8]) -> Result<Trajectory> {
    let json = if flags & FLAG_LZ4 != 0 {
        lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::Corrupted(format!("LZ4 decompression failed: {e}")))?
    } else {
        payload.to_vec()
    };
    Ok(serde_json::from_slice(&json)?)
}

/// Reads one record at a known location.
pub(super) fn read_record_at(path: &Path, offset: u64) -> Result<Trajectory> {
    let mut file = File::open(path).map_err(|e| Error::io("open log for point read", e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io("seek record", e))?;

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)
        .map_err(|e| Error::io("read record length", e))?;
    let length = u32::from_le_bytes(len_bytes) as usize;
    if length == 0 {
        return Err(Error::Corrupted(format!("empty record at offset {offset}")));
    }

    let mut body = vec![0u8; length];
    file.read_exact(&mut body)
        .map_err(|e| Error::io("read record body", e))?;

    decode_payload(body[0], &body[1..])
}

#[derive(Debug)]
pub(super) struct ScanResult {
    pub stats: LogStats,
    pub records: Vec<ScannedRecord>,
    pub rollback: RollbackState,
    pub records_end: u64,
}

/// Full validating scan of a v2 log: verifies magic, version, record count
/// and checksum, and decodes every record.
pub(super) fn scan_v2(path: &Path) -> Result<ScanResult> {
    let bytes = std::fs::read(path).map_err(|e| Error::io("read trajectory log", e))?;
    if bytes.len() < HEADER_LEN_V2 as usize {
        return Err(Error::Corrupted("trajectory log shorter than header".into()));
    }
    if &bytes[0..4] != LOG_MAGIC {
        return Err(Error::Corrupted("bad trajectory log magic".into()));
    }

    let version = le_u32(&bytes, 4);
    if version != LOG_VERSION_V2 {
        return Err(Error::Corrupted(format!(
            "expected log version 2, found {version} (run migrate_to_version)"
        )));
    }

    let declared_count = le_u32(&bytes, 8);
    let declared_crc = le_u32(&bytes, 12);
    let rollback_off = u64::from(le_u32(&bytes, 16));

    let records_end = if rollback_off == 0 {
        bytes.len() as u64
    } else {
        rollback_off
    };
    if records_end < HEADER_LEN_V2 || records_end > bytes.len() as u64 {
        return Err(Error::Corrupted("rollback offset out of range".into()));
    }

    let record_region = &bytes[HEADER_LEN_V2 as usize..records_end as usize];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(record_region);
    let actual_crc = hasher.finalize();
    if actual_crc != declared_crc {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: header {declared_crc:#010x}, records {actual_crc:#010x}"
        )));
    }

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < record_region.len() {
        if pos + 4 > record_region.len() {
            return Err(Error::Corrupted("truncated record length".into()));
        }
        let length =
            le_u32(record_region, pos) as usize;
        if length == 0 || pos + 4 + length > record_region.len() {
            return Err(Error::Corrupted("record overruns the record region".into()));
        }

        let flags = record_region[pos + 4];
        let payload = &record_region[pos + 5..pos + 4 + length];
        records.push(ScannedRecord {
            offset: HEADER_LEN_V2 + pos as u64,
            byte_len: 4 + length as u64,
            trajectory: decode_payload(flags, payload)?,
        });
        pos += 4 + length;
    }

    if records.len() != declared_count as usize {
        return Err(Error::Corrupted(format!(
            "header claims {declared_count} records, found {}",
            records.len()
        )));
    }

    let rollback = if rollback_off == 0 {
        RollbackState::default()
    } else {
        serde_json::from_slice(&bytes[rollback_off as usize..])
            .map_err(|e| Error::Corrupted(format!("bad rollback state: {e}")))?
    };

    Ok(ScanResult {
        stats: LogStats {
            version,
            record_count: declared_count,
            checksum: declared_crc,
            byte_len: bytes.len() as u64,
        },
        records,
        rollback,
        records_end,
    })
}

/// Validating scan of a legacy v1 log.
pub(super) fn scan_v1(path: &Path) -> Result<ScanResult> {
    let bytes = std::fs::read(path).map_err(|e| Error::io("read trajectory log", e))?;
    if bytes.len() < HEADER_LEN_V1 as usize {
        return Err(Error::Corrupted("v1 log shorter than header".into()));
    }
    if &bytes[0..4] != LOG_MAGIC {
        return Err(Error::Corrupted("bad trajectory log magic".into()));
    }

    let version = le_u32(&bytes, 4);
    if version != LOG_VERSION_V1 {
        return Err(Error::Corrupted(format!(
            "expected log version 1, found {version}"
        )));
    }

    let declared_count = le_u32(&bytes, 8);
    let declared_crc = le_u32(&bytes, 12);

    let record_region = &bytes[HEADER_LEN_V1 as usize..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(record_region);
    if hasher.finalize() != declared_crc {
        return Err(Error::Corrupted("v1 checksum mismatch".into()));
    }

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < record_region.len() {
        if pos + 4 > record_region.len() {
            return Err(Error::Corrupted("truncated v1 record length".into()));
        }
        let length =
            le_u32(record_region, pos) as usize;
        if length == 0 || pos + 4 + length > record_region.len() {
            return Err(Error::Corrupted("v1 record overruns the file".into()));
        }

        let payload = &record_region[pos + 4..pos + 4 + length];
        records.push(ScannedRecord {
            offset: HEADER_LEN_V1 + pos as u64,
            byte_len: 4 + length as u64,
            trajectory: serde_json::from_slice(payload)?,
        });
        pos += 4 + length;
    }

    if records.len() != declared_count as usize {
        return Err(Error::Corrupted(format!(
            "v1 header claims {declared_count} records, found {}",
            records.len()
        )));
    }

    Ok(ScanResult {
        stats: LogStats {
            version,
            record_count: declared_count,
            checksum: declared_crc,
            byte_len: bytes.len() as u64,
        },
        records,
        rollback: RollbackState::default(),
        records_end: bytes.len() as u64,
    })
}

/// Encodes a whole v1 log file from records.
pub(super) fn encode_v1_file(records: &[Trajectory]) -> Result<Vec<u8>> {
    let mut region = Vec::new();
    for trajectory in records {
        let json = serde_json::to_vec(trajectory)?;
        let length = u32::try_from(json.len())
            .map_err(|_| Error::InvalidInput("trajectory payload exceeds 4 GiB".into()))?;
        region.extend_from_slice(&length.to_le_bytes());
        region.extend_from_slice(&json);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&region);

    let mut out = Vec::with_capacity(HEADER_LEN_V1 as usize + region.len());
    out.extend_from_slice(LOG_MAGIC);
    out.extend_from_slice(&LOG_VERSION_V1.to_le_bytes());
    out.extend_from_slice(
        &u32::try_from(records.len())
            .map_err(|_| Error::InvalidInput("record count overflow".into()))?
            .to_le_bytes(),
    );
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&region);
    Ok(out)
}

/// Encodes a whole v2 log file from records and a rollback state.
pub(super) fn encode_v2_file(
    records: &[Trajectory],
    rollback: &RollbackState,
    compress: bool,
) -> Result<Vec<u8>> {
    let mut region = Vec::new();
    for trajectory in records {
        region.extend_from_slice(&encode_record(trajectory, compress)?);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&region);

    let state_json = serde_json::to_vec(rollback)?;
    let state_off = u32::try_from(HEADER_LEN_V2 as usize + region.len())
        .map_err(|_| Error::InvalidInput("trajectory log exceeds 4 GiB".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN_V2 as usize + region.len() + state_json.len());
    out.extend_from_slice(LOG_MAGIC);
    out.extend_from_slice(&LOG_VERSION_V2.to_le_bytes());
    out.extend_from_slice(
        &u32::try_from(records.len())
            .map_err(|_| Error::InvalidInput("record count overflow".into()))?
            .to_le_bytes(),
    );
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&state_off.to_le_bytes());
    out.extend_from_slice(&region);
    out.extend_from_slice(&state_json);
    Ok(out)
}

/// Reads version and header stats without a full scan.
pub(super) fn peek_stats(path: &Path) -> Result<LogStats> {
    let mut file = File::open(path).map_err(|e| Error::io("open log header", e))?;
    let byte_len = file
        .metadata()
        .map_err(|e| Error::io("stat log", e))?
        .len();

    let mut header = [0u8; 16];
    file.read_exact(&mut header)
        .map_err(|e| Error::io("read log header", e))?;
    if &header[0..4] != LOG_MAGIC {
        return Err(Error::Corrupted("bad trajectory log magic".into()));
    }

    Ok(LogStats {
        version: le_u32(&header, 4),
        record_count: le_u32(&header, 8),
        checksum: le_u32(&header, 12),
        byte_len,
    })
}

#[cfg(test)]
mod tests {
    use super::super::TrajectoryStatus;
    use super::*;

    fn trajectory(id: u64) -> Trajectory {
        Trajectory {
            trajectory_id: id,
            route: "coder".into(),
            step_count: 3,
            quality_score: 0.8,
            created_at: 1_700_000_000,
            completed_at: Some(1_700_000_100),
            status: TrajectoryStatus::Completed,
            payload: Some(serde_json::json!({"steps": ["plan", "edit", "test"]})),
        }
    }

    #[test]
    fn append_then_scan_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        let mut writer = LogWriter::open_or_create(&path, true).unwrap();

        let batch: Vec<Trajectory> = (0..5).map(trajectory).collect();
        let locations = writer.append_batch(&batch).unwrap();
        assert_eq!(locations.len(), 5);

        let scan = scan_v2(&path).unwrap();
        assert_eq!(scan.stats.record_count, 5);
        assert_eq!(scan.records.len(), 5);
        assert_eq!(scan.records[2].trajectory, trajectory(2));
        assert_eq!(scan.records[0].offset, HEADER_LEN_V2);
    }

    #[test]
    fn point_reads_use_index_locations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        let mut writer = LogWriter::open_or_create(&path, true).unwrap();
        let locations = writer
            .append_batch(&(0..3).map(trajectory).collect::<Vec<_>>())
            .unwrap();

        for (i, (offset, _)) in locations.iter().enumerate() {
            let t = read_record_at(&path, *offset).unwrap();
            assert_eq!(t.trajectory_id, i as u64);
        }
    }

    #[test]
    fn reopen_resumes_running_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        {
            let mut writer = LogWriter::open_or_create(&path, false).unwrap();
            writer.append_batch(&[trajectory(1)]).unwrap();
        }
        {
            let mut writer = LogWriter::open_or_create(&path, false).unwrap();
            assert_eq!(writer.record_count(), 1);
            writer.append_batch(&[trajectory(2)]).unwrap();
        }

        let scan = scan_v2(&path).unwrap();
        assert_eq!(scan.stats.record_count, 2);
    }

    #[test]
    fn rollback_state_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        let mut writer = LogWriter::open_or_create(&path, true).unwrap();
        writer.append_batch(&[trajectory(1)]).unwrap();

        let state = RollbackState {
            last_rollback_checkpoint_id: Some("cp-1".into()),
            last_rollback_at: Some(1_700_000_000),
            rollback_count: 2,
        };
        writer.set_rollback_state(state.clone()).unwrap();

        let scan = scan_v2(&path).unwrap();
        assert_eq!(scan.rollback, state);
        // Records survive the rollback-state rewrite.
        assert_eq!(scan.stats.record_count, 1);
    }

    #[test]
    fn encode_of_decode_is_identity() {
        let records: Vec<Trajectory> = (0..4).map(trajectory).collect();
        let state = RollbackState {
            last_rollback_checkpoint_id: Some("cp-9".into()),
            last_rollback_at: Some(5),
            rollback_count: 1,
        };
        let bytes = encode_v2_file(&records, &state, true).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, &bytes).unwrap();

        let scan = scan_v2(&path).unwrap();
        let decoded: Vec<Trajectory> = scan.records.iter().map(|r| r.trajectory.clone()).collect();
        let reencoded = encode_v2_file(&decoded, &scan.rollback, true).unwrap();
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn lz4_compresses_json_payloads() {
        let mut big = trajectory(1);
        big.payload = Some(serde_json::json!({
            "trace": vec!["the same step text repeated to make it compressible"; 200]
        }));

        let plain = encode_v2_file(&[big.clone()], &RollbackState::default(), false).unwrap();
        let packed = encode_v2_file(&[big], &RollbackState::default(), true).unwrap();
        assert!((packed.len() as f64) < plain.len() as f64 * 0.4);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories-0.log");
        let mut writer = LogWriter::open_or_create(&path, true).unwrap();
        writer
            .append_batch(&(0..3).map(trajectory).collect::<Vec<_>>())
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN_V2 as usize + 7] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(scan_v2(&path).unwrap_err().code(), "SONA-017");
    }

    #[test]
    fn v1_roundtrip() {
        let records: Vec<Trajectory> = (0..3).map(trajectory).collect();
        let bytes = encode_v1_file(&records).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.log");
        std::fs::write(&path, &bytes).unwrap();

        let scan = scan_v1(&path).unwrap();
        assert_eq!(scan.stats.version, LOG_VERSION_V1);
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[1].trajectory, trajectory(1));
    }
}
