//! Fire-and-forget observability events.
//!
//! Caches and the relay orchestrator publish structured events through an
//! [`EventSink`]. Emission must never block or fail the producing path:
//! events are logged via `tracing` and, when a subscriber channel is
//! attached, forwarded with `try_send` so a full channel drops the event
//! instead of stalling the writer.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::Arc;

/// A structured observability event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A cache lookup was served from memory.
    CacheHit {
        /// Cache that served the hit.
        cache_name: &'static str,
        /// Key that was looked up.
        key: String,
    },
    /// A cache lookup fell through to the primary store.
    CacheMiss {
        /// Cache that missed.
        cache_name: &'static str,
        /// Key that was looked up.
        key: String,
    },
    /// An entry was evicted to satisfy the count or memory cap.
    CacheEviction {
        /// Cache the eviction happened in.
        cache_name: &'static str,
        /// Key of the evicted entry.
        evicted_key: String,
        /// Size of the evicted entry in bytes.
        size_bytes: usize,
        /// Evictions since the cache was created.
        total_evictions: u64,
        /// Entry count after the eviction.
        cache_size: usize,
        /// Accounted memory after the eviction.
        memory_bytes: usize,
    },
    /// A pipeline step changed state.
    AgentStep {
        /// Step lifecycle phase: `start`, `retrieve`, `store`, `complete` or `fail`.
        phase: &'static str,
        /// Agent executing the step.
        agent: String,
        /// Optional detail (memory key, error text).
        detail: Option<String>,
    },
    /// A pipeline changed state.
    Pipeline {
        /// Lifecycle phase: `start`, `complete` or `fail`.
        phase: &'static str,
        /// Pipeline name.
        pipeline: String,
        /// Number of steps.
        steps: usize,
    },
}

impl Event {
    /// Short name used for log targeting.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::CacheEviction { .. } => "cache_eviction",
            Self::AgentStep { .. } => "agent_step",
            Self::Pipeline { .. } => "pipeline",
        }
    }
}

/// Non-blocking event publisher shared by caches and the relay.
///
/// Cloning is cheap; all clones feed the same optional channel.
#[derive(Clone, Default)]
pub struct EventSink {
    channel: Option<Arc<Sender<Event>>>,
}

impl EventSink {
    /// Creates a sink that only logs via `tracing`.
    #[must_use]
    pub fn new() -> Self {
        Self { channel: None }
    }

    /// Creates a sink with a bounded subscriber channel.
    ///
    /// Returns the sink and the receiving end. When the channel is full the
    /// event is dropped; the producer is never blocked.
    #[must_use]
    pub fn with_channel(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                channel: Some(Arc::new(tx)),
            },
            rx,
        )
    }

    /// Publishes an event. Failures are swallowed locally.
    pub fn emit(&self, event: Event) {
        tracing::debug!(target: "sona::events", event = event.name(), payload = ?event);

        if let Some(tx) = &self.channel {
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribed", &self.channel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_channel_is_noop() {
        let sink = EventSink::new();
        sink.emit(Event::CacheHit {
            cache_name: "episodes",
            key: "42".into(),
        });
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, rx) = EventSink::with_channel(1);
        for i in 0..10 {
            sink.emit(Event::CacheMiss {
                cache_name: "episodes",
                key: i.to_string(),
            });
        }
        // Only the first event fit; the rest were dropped silently.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn eviction_event_serializes_with_tag() {
        let event = Event::CacheEviction {
            cache_name: "episodes",
            evicted_key: "7".into(),
            size_bytes: 128,
            total_evictions: 3,
            cache_size: 2,
            memory_bytes: 256,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cache_eviction");
        assert_eq!(json["total_evictions"], 3);
    }
}
