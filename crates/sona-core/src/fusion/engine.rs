//! The quad-fusion orchestrator.
//!
//! All configured sources run as independent tasks, each under its own
//! deadline. Failing sources are recorded and skipped; only when every
//! source fails does the whole search fail. Surviving raw hits are
//! deduplicated by a SHA-256 content prefix and fused with normalized
//! per-source weights.

use super::breaker::CircuitBreaker;
use super::source::{
    EmbeddingEnhancer, RawHit, SearchRequest, SearchSource, SourceKind, SourceOutcome,
};
use crate::config::FusionConfig;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Hard ceiling on the per-source deadline.
const MAX_SOURCE_TIMEOUT_MS: u64 = 500;
/// Hard ceiling on query text size.
const MAX_QUERY_BYTES: usize = 16 * 1024;

/// Terminal outcome of one source in one query.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    /// The source.
    pub kind: SourceKind,
    /// How it finished.
    pub outcome: SourceOutcome,
}

/// One fused, deduplicated result.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    /// 16-hex-character SHA-256 prefix of the canonicalized content.
    pub hash: String,
    /// The content.
    pub content: String,
    /// Weighted fused score.
    pub score: f32,
    /// Best raw score per contributing source.
    pub attribution: Vec<(SourceKind, f32)>,
    /// Source-local ids coalesced into this hit.
    pub ids: Vec<String>,
}

/// A completed fusion query.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionResponse {
    /// Fused results, best first.
    pub results: Vec<FusedHit>,
    /// Per-source outcomes, in weight order.
    pub sources: Vec<SourceReport>,
}

/// Concurrent four-source search with weighted fusion.
pub struct QuadFusion {
    config: FusionConfig,
    weights: [f32; 4],
    sources: Vec<Arc<dyn SearchSource>>,
    enhancer: Option<(Arc<dyn EmbeddingEnhancer>, CircuitBreaker)>,
}

impl std::fmt::Debug for QuadFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadFusion")
            .field("config", &self.config)
            .field("weights", &self.weights)
            .field("source_count", &self.sources.len())
            .field("has_enhancer", &self.enhancer.is_some())
            .finish()
    }
}

impl QuadFusion {
    /// Creates an engine with no sources attached yet.
    ///
    /// # Errors
    ///
    /// Rejects weights that are negative or do not sum to 1.
    pub fn new(config: FusionConfig) -> Result<Self> {
        let sum: f32 = config.weights.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(Error::InvalidInput(format!(
                "fusion weights must sum to 1.0, got {sum:.4}"
            )));
        }
        if config.weights.iter().any(|w| *w < 0.0) {
            return Err(Error::InvalidInput(
                "fusion weights must be non-negative".into(),
            ));
        }

        // Normalize residual float error away.
        let mut weights = config.weights;
        for w in &mut weights {
            *w /= sum;
        }

        Ok(Self {
            config,
            weights,
            sources: Vec::new(),
            enhancer: None,
        })
    }

    /// Attaches a source. Attaching two sources of the same kind replaces
    /// the earlier one.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SearchSource>) -> Self {
        self.sources.retain(|s| s.kind() != source.kind());
        self.sources.push(source);
        self
    }

    /// Attaches the GNN pre-search hook behind a circuit breaker.
    #[must_use]
    pub fn with_enhancer(
        mut self,
        enhancer: Arc<dyn EmbeddingEnhancer>,
        reset_timeout: Duration,
    ) -> Self {
        self.enhancer = Some((enhancer, CircuitBreaker::new(reset_timeout)));
        self
    }

    /// Runs the fused search.
    ///
    /// # Errors
    ///
    /// Returns typed input errors for bad `top_k` or oversize queries, and
    /// [`Error::AllSourcesFailed`] when every source timed out or errored.
    /// An empty result set from responding sources is not an error.
    pub async fn search(&self, mut request: SearchRequest) -> Result<FusionResponse> {
        if request.top_k == 0 || request.top_k > self.config.max_top_k {
            return Err(Error::InvalidInput(format!(
                "top_k {} outside 1..={}",
                request.top_k, self.config.max_top_k
            )));
        }
        if request.query_text.len() > MAX_QUERY_BYTES {
            return Err(Error::InvalidInput(format!(
                "query text exceeds {MAX_QUERY_BYTES} bytes"
            )));
        }
        if self.sources.is_empty() {
            return Err(Error::InvalidInput("no fusion sources attached".into()));
        }

        self.apply_enhancer(&mut request);

        let deadline = Duration::from_millis(
            self.config.source_timeout_ms.min(MAX_SOURCE_TIMEOUT_MS),
        );
        let request = Arc::new(request);

        let mut set: JoinSet<(SourceKind, std::result::Result<Vec<RawHit>, SourceOutcome>, u64)> =
            JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            let request = Arc::clone(&request);
            set.spawn(async move {
                let kind = source.kind();
                let start = Instant::now();
                match tokio::time::timeout(deadline, source.search(request)).await {
                    Ok(Ok(hits)) => {
                        let elapsed = elapsed_ms(start);
                        (kind, Ok(hits), elapsed)
                    }
                    Ok(Err(e)) => {
                        let elapsed = elapsed_ms(start);
                        tracing::warn!(source = kind.name(), error = %e, "fusion source failed");
                        (
                            kind,
                            Err(SourceOutcome::Errored {
                                message: e.to_string(),
                                duration_ms: elapsed,
                            }),
                            elapsed,
                        )
                    }
                    Err(_) => {
                        let elapsed = elapsed_ms(start);
                        tracing::warn!(source = kind.name(), "fusion source timed out");
                        (
                            kind,
                            Err(SourceOutcome::TimedOut {
                                duration_ms: elapsed,
                            }),
                            elapsed,
                        )
                    }
                }
            });
        }

        let mut reports: Vec<SourceReport> = Vec::with_capacity(self.sources.len());
        let mut hits_by_kind: Vec<(SourceKind, Vec<RawHit>)> = Vec::new();

        while let Some(joined) = set.join_next().await {
            let (kind, result, duration_ms) =
                joined.map_err(|e| Error::Internal(format!("source task join error: {e}")))?;
            match result {
                Ok(hits) => {
                    reports.push(SourceReport {
                        kind,
                        outcome: SourceOutcome::Responded {
                            hits: hits.len(),
                            duration_ms,
                        },
                    });
                    hits_by_kind.push((kind, hits));
                }
                Err(outcome) => reports.push(SourceReport { kind, outcome }),
            }
        }
        reports.sort_by_key(|r| r.kind.weight_index());

        if reports.iter().all(|r| !r.outcome.responded()) {
            let summary = reports
                .iter()
                .map(|r| format!("{}: {:?}", r.kind.name(), r.outcome))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::AllSourcesFailed(summary));
        }

        let results = self.fuse(hits_by_kind, request.top_k);
        Ok(FusionResponse { results, sources: reports })
    }

    fn apply_enhancer(&self, request: &mut SearchRequest) {
        let Some((enhancer, breaker)) = &self.enhancer else {
            return;
        };
        if !breaker.allows() {
            return;
        }
        match enhancer.enhance(&request.embedding) {
            Ok(enhanced) => {
                breaker.record_success();
                request.embedding = enhanced;
            }
            Err(e) => {
                breaker.record_failure();
                tracing::warn!(error = %e, "embedding enhancement failed, using raw embedding");
            }
        }
    }

    /// Dedup by content hash, then weight and rank.
    fn fuse(&self, hits_by_kind: Vec<(SourceKind, Vec<RawHit>)>, top_k: usize) -> Vec<FusedHit> {
        struct Coalesced {
            content: String,
            best: [Option<f32>; 4],
            ids: Vec<String>,
        }

        let mut map: FxHashMap<String, Coalesced> = FxHashMap::default();
        let mut order: Vec<String> = Vec::new();

        for (kind, hits) in hits_by_kind {
            let slot = kind.weight_index();
            for hit in hits {
                let hash = content_hash(&hit.content);
                let entry = map.entry(hash.clone()).or_insert_with(|| {
                    order.push(hash.clone());
                    Coalesced {
                        content: hit.content.clone(),
                        best: [None; 4],
                        ids: Vec::new(),
                    }
                });
                let score = hit.score.clamp(0.0, 1.0);
                entry.best[slot] = Some(entry.best[slot].map_or(score, |b: f32| b.max(score)));
                if !entry.ids.contains(&hit.id) {
                    entry.ids.push(hit.id);
                }
            }
        }

        let mut fused: Vec<FusedHit> = order
            .into_iter()
            .filter_map(|hash| {
                let entry = map.remove(&hash)?;
                let score = entry
                    .best
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.map(|s| self.weights[i] * s))
                    .sum();
                let attribution = [
                    SourceKind::Vector,
                    SourceKind::Graph,
                    SourceKind::Memory,
                    SourceKind::Pattern,
                ]
                .into_iter()
                .filter_map(|kind| entry.best[kind.weight_index()].map(|s| (kind, s)))
                .collect();

                Some(FusedHit {
                    hash,
                    content: entry.content,
                    score,
                    attribution,
                    ids: entry.ids,
                })
            })
            .collect();

        fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.hash.cmp(&b.hash)));
        fused.truncate(top_k);
        fused
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// 16-hex-character SHA-256 prefix over the canonicalized content:
/// whitespace runs collapsed to single spaces, leading/trailing trimmed.
fn content_hash(content: &str) -> String {
    let canonical = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}
