//! Storage-root scanning and per-file format probing.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Detected file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Json,
    Binary,
    Sqlite,
    Hnsw,
    Unknown,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
            Self::Sqlite => "sqlite",
            Self::Hnsw => "hnsw",
            Self::Unknown => "unknown",
        }
    }
}

/// Per-file scan result.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub detected_dimension: Option<usize>,
    pub vector_count: Option<usize>,
    pub needs_migration: bool,
}

/// Aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_files: usize,
    pub files_with_vectors: usize,
    pub files_needing_migration: usize,
    pub expected_dimension: usize,
}

/// The whole report.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub files: Vec<FileReport>,
    pub summary: Summary,
}

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
const HNSW_MAGIC: &[u8] = b"SHNW";
const TRAJ_MAGIC: &[u8] = b"TRAJ";

/// Walks `root` and probes every regular file.
pub fn scan_root(root: &Path, expected_dimension: usize) -> Result<ScanReport> {
    let mut files = Vec::new();
    walk(root, root, &mut files, expected_dimension)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let summary = Summary {
        total_files: files.len(),
        files_with_vectors: files.iter().filter(|f| f.vector_count.unwrap_or(0) > 0).count(),
        files_needing_migration: files.iter().filter(|f| f.needs_migration).count(),
        expected_dimension,
    };
    Ok(ScanReport { files, summary })
}

fn walk(
    root: &Path,
    dir: &Path,
    out: &mut Vec<FileReport>,
    expected_dimension: usize,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot list directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out, expected_dimension)?;
        } else if path.is_file() {
            out.push(probe_file(root, &path, expected_dimension));
        }
    }
    Ok(())
}

fn probe_file(root: &Path, path: &Path, expected_dimension: usize) -> FileReport {
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string();

    let header = read_prefix(path, 64);
    let (file_type, detected_dimension, vector_count, version_mismatch) =
        classify(path, &header, expected_dimension);

    let needs_migration = version_mismatch
        || detected_dimension.is_some_and(|d| d != expected_dimension);

    FileReport {
        path: relative,
        file_type,
        detected_dimension,
        vector_count,
        needs_migration,
    }
}

fn read_prefix(path: &Path, n: usize) -> Vec<u8> {
    use std::io::Read;
    let mut buf = vec![0u8; n];
    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let read = file.read(&mut buf).unwrap_or(0);
    buf.truncate(read);
    buf
}

/// Returns (type, dimension, vector count, version mismatch).
fn classify(
    path: &Path,
    header: &[u8],
    _expected_dimension: usize,
) -> (FileType, Option<usize>, Option<usize>, bool) {
    if header.starts_with(SQLITE_MAGIC) {
        return (FileType::Sqlite, None, None, false);
    }

    if header.starts_with(HNSW_MAGIC) {
        return probe_hnsw(path, header);
    }

    if header.starts_with(TRAJ_MAGIC) {
        // Version at offset 4, record count at offset 8.
        let version = header
            .get(4..8)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        let count = header
            .get(8..12)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize);
        let stale = version.is_some_and(|v| v < sona_core::trajectory::LOG_VERSION_V2);
        return (FileType::Binary, None, count, stale);
    }

    if looks_like_json(header) {
        return probe_json(path);
    }

    if path.file_name().is_some_and(|n| n == "learning.db") {
        return probe_learning_db(path);
    }

    if header.is_empty() {
        return (FileType::Unknown, None, None, false);
    }

    (FileType::Unknown, None, None, false)
}

fn looks_like_json(header: &[u8]) -> bool {
    header
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

fn probe_hnsw(path: &Path, header: &[u8]) -> (FileType, Option<usize>, Option<usize>, bool) {
    // Dimension sits at offset 8 of the snapshot header.
    let dimension = header
        .get(8..12)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize);

    // A full decode also yields the node count; failures degrade to the
    // header-only view.
    let count = std::fs::read(path)
        .ok()
        .and_then(|bytes| sona_core::HnswIndex::from_bytes(&bytes).ok())
        .map(|index| index.stats().node_count);

    (FileType::Hnsw, dimension, count, false)
}

fn probe_json(path: &Path) -> (FileType, Option<usize>, Option<usize>, bool) {
    let Ok(bytes) = std::fs::read(path) else {
        return (FileType::Json, None, None, false);
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return (FileType::Json, None, None, false);
    };

    let mut dimension = None;
    let mut count = 0usize;
    find_embeddings(&value, &mut dimension, &mut count);
    (
        FileType::Json,
        dimension,
        if count > 0 { Some(count) } else { None },
        false,
    )
}

/// Recursively looks for arrays of at least 8 numbers, treating them as
/// embeddings.
fn find_embeddings(value: &serde_json::Value, dimension: &mut Option<usize>, count: &mut usize) {
    match value {
        serde_json::Value::Array(items) => {
            if items.len() >= 8 && items.iter().all(serde_json::Value::is_number) {
                dimension.get_or_insert(items.len());
                *count += 1;
            } else {
                for item in items {
                    find_embeddings(item, dimension, count);
                }
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                find_embeddings(item, dimension, count);
            }
        }
        _ => {}
    }
}

fn probe_learning_db(path: &Path) -> (FileType, Option<usize>, Option<usize>, bool) {
    use sona_core::episode::EpisodeStore;

    let Some(parent) = path.parent() else {
        return (FileType::Binary, None, None, false);
    };

    // The store validates dimensions on insert only, so 0 is a safe probe.
    let Ok(store) = sona_core::LogEpisodeStore::open(parent, 0) else {
        return (FileType::Binary, None, None, false);
    };

    let count = store.count().ok();
    let dimension = store
        .find_all()
        .ok()
        .and_then(|episodes| {
            episodes
                .iter()
                .flat_map(|e| e.query_chunk_embeddings.first())
                .map(Vec::len)
                .next()
        });

    (FileType::Binary, dimension, count, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sona_core::episode::EpisodeStore;

    #[test]
    fn classifies_the_standard_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // learning.db with one episode at dimension 8.
        let store = sona_core::LogEpisodeStore::open(root, 8).unwrap();
        store
            .insert(&sona_core::Episode {
                episode_id: 1,
                query_text: "q".into(),
                answer_text: "a".into(),
                query_chunk_embeddings: vec![vec![0.1; 8]],
                answer_chunk_embeddings: vec![vec![0.2; 8]],
                created_at: 0,
                metadata: None,
            })
            .unwrap();
        store.close().unwrap();

        // An HNSW snapshot at dimension 8.
        let index = sona_core::HnswIndex::new(
            8,
            sona_core::DistanceMetric::Cosine,
            sona_core::HnswParams::default(),
        );
        index.insert("v", &[0.5; 8]).unwrap();
        std::fs::write(root.join("episodes.hnsw"), index.to_bytes().unwrap()).unwrap();

        // A JSON file with no embeddings.
        std::fs::write(root.join("index.json"), r#"{"entries": {}}"#).unwrap();

        let report = scan_root(root, 8).unwrap();
        assert_eq!(report.summary.total_files, 3);
        assert_eq!(report.summary.files_needing_migration, 0);

        let by_path = |suffix: &str| {
            report
                .files
                .iter()
                .find(|f| f.path.ends_with(suffix))
                .unwrap()
        };
        assert_eq!(by_path("learning.db").file_type, FileType::Binary);
        assert_eq!(by_path("learning.db").detected_dimension, Some(8));
        assert_eq!(by_path("episodes.hnsw").file_type, FileType::Hnsw);
        assert_eq!(by_path("episodes.hnsw").detected_dimension, Some(8));
        assert_eq!(by_path("episodes.hnsw").vector_count, Some(1));
        assert_eq!(by_path("index.json").file_type, FileType::Json);
    }

    #[test]
    fn flags_dimension_drift() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let index = sona_core::HnswIndex::new(
            16,
            sona_core::DistanceMetric::Cosine,
            sona_core::HnswParams::default(),
        );
        index.insert("v", &[0.5; 16]).unwrap();
        std::fs::write(root.join("old.hnsw"), index.to_bytes().unwrap()).unwrap();

        let report = scan_root(root, 1536).unwrap();
        assert_eq!(report.summary.files_needing_migration, 1);
        assert!(report.files[0].needs_migration);
    }

    #[test]
    fn unknown_files_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.bin"), &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        let report = scan_root(dir.path(), 1536).unwrap();
        assert_eq!(report.files[0].file_type, FileType::Unknown);
        assert!(!report.files[0].needs_migration);
    }
}
