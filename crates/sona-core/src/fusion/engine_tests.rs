//! Behavioral tests for the fusion engine.

use super::engine::QuadFusion;
use super::source::{
    BoxFuture, EmbeddingEnhancer, RawHit, SearchRequest, SearchSource, SourceKind, SourceOutcome,
};
use crate::config::FusionConfig;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scripted source: fixed hits, optional delay, optional failure.
struct StaticSource {
    kind: SourceKind,
    hits: Vec<RawHit>,
    delay_ms: u64,
    fail: bool,
}

impl StaticSource {
    fn new(kind: SourceKind, hits: Vec<RawHit>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            hits,
            delay_ms: 0,
            fail: false,
        })
    }

    fn slow(kind: SourceKind, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            kind,
            hits: vec![hit("late", 0.9)],
            delay_ms,
            fail: false,
        })
    }

    fn failing(kind: SourceKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            hits: Vec::new(),
            delay_ms: 0,
            fail: true,
        })
    }
}

impl SearchSource for StaticSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn search(self: Arc<Self>, _request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(Error::Internal("scripted failure".into()));
            }
            Ok(self.hits.clone())
        })
    }
}

fn hit(content: &str, score: f32) -> RawHit {
    RawHit {
        id: format!("id-{content}"),
        content: content.to_string(),
        score,
        metadata: None,
    }
}

fn three_hits(prefix: &str) -> Vec<RawHit> {
    vec![
        hit(&format!("{prefix}-a"), 0.9),
        hit(&format!("{prefix}-b"), 0.7),
        hit(&format!("{prefix}-c"), 0.5),
    ]
}

fn request(top_k: usize) -> SearchRequest {
    SearchRequest {
        query_text: "how do agents learn".into(),
        embedding: vec![0.5; 8],
        domain: None,
        tags: Vec::new(),
        top_k,
    }
}

fn engine_with(sources: Vec<Arc<dyn SearchSource>>) -> QuadFusion {
    let mut engine = QuadFusion::new(FusionConfig::default()).unwrap();
    for source in sources {
        engine = engine.with_source(source);
    }
    engine
}

#[tokio::test]
async fn slow_source_times_out_others_survive() {
    // Graph sleeps past the 400ms deadline; the other three respond.
    let engine = engine_with(vec![
        StaticSource::new(SourceKind::Vector, three_hits("vec")),
        StaticSource::slow(SourceKind::Graph, 800),
        StaticSource::new(SourceKind::Memory, three_hits("mem")),
        StaticSource::new(SourceKind::Pattern, three_hits("pat")),
    ]);

    let start = Instant::now();
    let response = engine.search(request(20)).await.unwrap();
    assert!(start.elapsed() <= Duration::from_millis(600));

    // 9 unique results, sorted by weighted score.
    assert_eq!(response.results.len(), 9);
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let graph = response
        .sources
        .iter()
        .find(|r| r.kind == SourceKind::Graph)
        .unwrap();
    assert!(matches!(graph.outcome, SourceOutcome::TimedOut { .. }));
    for report in response.sources.iter().filter(|r| r.kind != SourceKind::Graph) {
        assert!(report.outcome.responded());
    }
}

#[tokio::test]
async fn duplicate_content_is_coalesced() {
    let shared = "shared finding about retries";
    let engine = engine_with(vec![
        StaticSource::new(SourceKind::Vector, vec![hit(shared, 0.8)]),
        StaticSource::new(SourceKind::Memory, vec![hit(shared, 0.6), hit("only-mem", 0.9)]),
    ]);

    let response = engine.search(request(10)).await.unwrap();
    assert_eq!(response.results.len(), 2);

    let coalesced = response
        .results
        .iter()
        .find(|r| r.content == shared)
        .unwrap();
    // Attribution union with per-source maxima.
    assert_eq!(coalesced.attribution.len(), 2);
    let weights = FusionConfig::default().weights;
    let expected = weights[0] * 0.8 + weights[2] * 0.6;
    assert!((coalesced.score - expected).abs() < 1e-6);
    assert_eq!(coalesced.ids.len(), 1); // same id from both sources

    assert_eq!(coalesced.hash.len(), 16);
}

#[tokio::test]
async fn all_sources_failing_is_a_typed_error() {
    let engine = engine_with(vec![
        StaticSource::failing(SourceKind::Vector),
        StaticSource::failing(SourceKind::Graph),
        StaticSource::failing(SourceKind::Memory),
        StaticSource::failing(SourceKind::Pattern),
    ]);

    let err = engine.search(request(5)).await.unwrap_err();
    assert_eq!(err.code(), "SONA-008");
}

#[tokio::test]
async fn empty_aggregate_is_not_an_error() {
    let engine = engine_with(vec![StaticSource::new(SourceKind::Vector, Vec::new())]);
    let response = engine.search(request(5)).await.unwrap();
    assert!(response.results.is_empty());
    assert!(response.sources[0].outcome.responded());
}

#[tokio::test]
async fn invalid_inputs_are_typed() {
    let engine = engine_with(vec![StaticSource::new(SourceKind::Vector, Vec::new())]);

    assert_eq!(
        engine.search(request(0)).await.unwrap_err().code(),
        "SONA-013"
    );
    assert_eq!(
        engine.search(request(101)).await.unwrap_err().code(),
        "SONA-013"
    );

    let mut oversize = request(5);
    oversize.query_text = "x".repeat(20_000);
    assert_eq!(engine.search(oversize).await.unwrap_err().code(), "SONA-013");
}

#[test]
fn bad_weights_are_rejected_at_construction() {
    let mut config = FusionConfig::default();
    config.weights = [0.9, 0.3, 0.2, 0.1];
    assert_eq!(QuadFusion::new(config).unwrap_err().code(), "SONA-013");

    let mut config = FusionConfig::default();
    config.weights = [1.2, -0.2, 0.0, 0.0];
    assert!(QuadFusion::new(config).is_err());
}

#[tokio::test]
async fn failing_sources_do_not_change_relative_order() {
    let vector_hits = three_hits("vec");
    let pattern_hits = three_hits("pat");

    let with_failures = engine_with(vec![
        StaticSource::new(SourceKind::Vector, vector_hits.clone()),
        StaticSource::failing(SourceKind::Graph),
        StaticSource::failing(SourceKind::Memory),
        StaticSource::new(SourceKind::Pattern, pattern_hits.clone()),
    ]);
    let without_failures = engine_with(vec![
        StaticSource::new(SourceKind::Vector, vector_hits),
        StaticSource::new(SourceKind::Pattern, pattern_hits),
    ]);

    let a: Vec<String> = with_failures
        .search(request(10))
        .await
        .unwrap()
        .results
        .into_iter()
        .map(|r| r.content)
        .collect();
    let b: Vec<String> = without_failures
        .search(request(10))
        .await
        .unwrap()
        .results
        .into_iter()
        .map(|r| r.content)
        .collect();

    assert_eq!(a, b);
}

/// Enhancer that always fails, counting invocations.
struct FlakyEnhancer {
    calls: AtomicUsize,
}

impl EmbeddingEnhancer for FlakyEnhancer {
    fn enhance(&self, _embedding: &[f32]) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("gnn offline".into()))
    }
}

#[tokio::test]
async fn enhancer_breaker_opens_after_five_failures() {
    let enhancer = Arc::new(FlakyEnhancer {
        calls: AtomicUsize::new(0),
    });
    let engine = engine_with(vec![StaticSource::new(
        SourceKind::Vector,
        three_hits("vec"),
    )])
    .with_enhancer(enhancer.clone(), Duration::from_secs(3600));

    for _ in 0..10 {
        // Searches keep succeeding on the raw embedding.
        engine.search(request(5)).await.unwrap();
    }

    // After five consecutive failures the breaker opened and the hook
    // stopped being called.
    assert_eq!(enhancer.calls.load(Ordering::SeqCst), 5);
}

/// Enhancer that doubles the embedding, proving the transform is applied.
struct DoublingEnhancer;

impl EmbeddingEnhancer for DoublingEnhancer {
    fn enhance(&self, embedding: &[f32]) -> Result<Vec<f32>> {
        Ok(embedding.iter().map(|v| v * 2.0).collect())
    }
}

/// Source that records the embedding it was queried with.
struct EmbeddingProbe {
    seen: parking_lot::Mutex<Vec<f32>>,
}

impl SearchSource for Arc<EmbeddingProbe> {
    fn kind(&self) -> SourceKind {
        SourceKind::Vector
    }

    fn search(self: Arc<Self>, request: Arc<SearchRequest>) -> BoxFuture<Result<Vec<RawHit>>> {
        Box::pin(async move {
            *self.seen.lock() = request.embedding.clone();
            Ok(Vec::new())
        })
    }
}

#[tokio::test]
async fn healthy_enhancer_transforms_the_embedding() {
    let probe = Arc::new(EmbeddingProbe {
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let engine = engine_with(vec![Arc::new(Arc::clone(&probe))])
        .with_enhancer(Arc::new(DoublingEnhancer), Duration::from_secs(60));

    engine.search(request(5)).await.unwrap();
    assert_eq!(*probe.seen.lock(), vec![1.0f32; 8]);
}
