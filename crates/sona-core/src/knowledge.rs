//! Knowledge-store collaborator interface.
//!
//! The knowledge store itself lives outside this crate (it is reached over
//! local IPC in production). The fusion memory/pattern sources and the
//! relay orchestrator consume it through the [`KnowledgeStore`] trait; an
//! in-memory implementation backs tests and single-process deployments.

use crate::error::Result;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A stored knowledge entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Unique id.
    pub id: String,
    /// Namespace / domain the entry belongs to.
    pub domain: String,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
    /// Entry content.
    pub content: String,
    /// Quality score in [0, 1].
    pub quality: f32,
    /// Last-used timestamp (Unix seconds).
    pub last_used: i64,
    /// Creation timestamp (Unix seconds).
    pub created_at: i64,
}

/// A reasoning heuristic with a confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique id.
    pub pattern_id: String,
    /// Pattern content.
    pub content: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Interface to the external knowledge store.
pub trait KnowledgeStore: Send + Sync + 'static {
    /// Stores a knowledge entry.
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn store(&self, entry: KnowledgeEntry) -> Result<()>;

    /// Entries in a domain, best quality first.
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn get_by_domain(&self, domain: &str, limit: usize) -> Result<Vec<KnowledgeEntry>>;

    /// Entries filtered by optional domain and tags, best quality first.
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn query(
        &self,
        domain: Option<&str>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>>;

    /// Patterns whose content matches `text` lexically, filtered by
    /// minimum confidence.
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn query_patterns(
        &self,
        text: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Pattern>>;

    /// Point read of an opaque value (relay step outputs).
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Point write of an opaque value (relay step outputs).
    ///
    /// # Errors
    ///
    /// Implementation-defined storage errors.
    fn put_value(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process knowledge store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    entries: RwLock<Vec<KnowledgeEntry>>,
    patterns: RwLock<Vec<Pattern>>,
    values: RwLock<FxHashMap<String, String>>,
}

impl InMemoryKnowledgeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds patterns (test helper).
    pub fn add_pattern(&self, pattern: Pattern) {
        self.patterns.write().push(pattern);
    }
}

impl KnowledgeStore for InMemoryKnowledgeStore {
    fn store(&self, entry: KnowledgeEntry) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        Ok(())
    }

    fn get_by_domain(&self, domain: &str, limit: usize) -> Result<Vec<KnowledgeEntry>> {
        self.query(Some(domain), &[], limit)
    }

    fn query(
        &self,
        domain: Option<&str>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        let entries = self.entries.read();
        let mut matched: Vec<KnowledgeEntry> = entries
            .iter()
            .filter(|e| domain.is_none_or(|d| e.domain == d))
            .filter(|e| tags.iter().all(|t| e.tags.contains(t)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.quality.total_cmp(&a.quality));
        matched.truncate(limit);
        Ok(matched)
    }

    fn query_patterns(
        &self,
        text: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        let needle = text.to_lowercase();
        let terms: Vec<&str> = needle.split_whitespace().collect();
        let patterns = self.patterns.read();
        let mut matched: Vec<Pattern> = patterns
            .iter()
            .filter(|p| p.confidence >= min_confidence)
            .filter(|p| {
                let haystack = p.content.to_lowercase();
                terms.iter().any(|t| haystack.contains(t))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        matched.truncate(limit);
        Ok(matched)
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn put_value(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
