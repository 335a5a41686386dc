//! Thin sequential pipeline driver.
//!
//! Each step retrieves its predecessor's output from the knowledge store
//! by memory key (missing output is fatal), runs the agent with a prompt
//! that names that key, stores the output under the step's declared key,
//! verifies the write by content-hash read-back, and applies the quality
//! gate. Steps run strictly sequentially; transient step failures retry
//! with exponential backoff up to a small bounded count.

use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::knowledge::KnowledgeStore;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Owned boxed future returned by [`AgentRunner::run`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Executes one agent invocation (an external collaborator).
pub trait AgentRunner: Send + Sync + 'static {
    /// Runs `agent` with `prompt`, resolving to the agent's output.
    fn run(self: Arc<Self>, agent: String, prompt: String) -> BoxFuture<Result<String>>;
}

/// Opaque quality estimator: output text to a score in [0, 1].
pub type QualityGate = Arc<dyn Fn(&str) -> f32 + Send + Sync>;

/// One step of a relay pipeline.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    /// Agent to spawn.
    pub agent: String,
    /// Memory key holding the previous step's output.
    pub input_key: String,
    /// Pre-declared key the output is stored under.
    pub output_key: String,
    /// Task instruction; the previous-output key and content are appended.
    pub instruction: String,
    /// Per-step deadline in milliseconds.
    pub timeout_ms: u64,
    /// Quality-gate threshold in [0, 1].
    pub quality_threshold: f32,
}

/// Bounded retry policy for transient step failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per step (first try included).
    pub max_attempts: u32,
    /// Base backoff delay, doubled per retry.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

/// Sequential agent step driver over a knowledge store.
pub struct RelayOrchestrator<K: KnowledgeStore> {
    store: Arc<K>,
    runner: Arc<dyn AgentRunner>,
    quality: QualityGate,
    retry: RetryPolicy,
    sink: EventSink,
}

impl<K: KnowledgeStore> RelayOrchestrator<K> {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<K>,
        runner: Arc<dyn AgentRunner>,
        quality: QualityGate,
        sink: EventSink,
    ) -> Self {
        Self {
            store,
            runner,
            quality,
            retry: RetryPolicy::default(),
            sink,
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs an ordered pipeline, seeding the first step's input key with
    /// `initial_input`. Resolves to the final step's output.
    ///
    /// # Errors
    ///
    /// Fatal conditions: a missing step input, a failed write
    /// verification, a quality-gate failure, or a step exhausting its
    /// retries.
    pub async fn run_pipeline(
        &self,
        pipeline: &str,
        initial_input: &str,
        steps: &[PipelineStep],
    ) -> Result<String> {
        if steps.is_empty() {
            return Err(Error::InvalidInput("pipeline has no steps".into()));
        }

        self.sink.emit(Event::Pipeline {
            phase: "start",
            pipeline: pipeline.to_string(),
            steps: steps.len(),
        });

        self.store.put_value(&steps[0].input_key, initial_input)?;

        let mut last_output = String::new();
        for step in steps {
            match self.run_step(step).await {
                Ok(output) => last_output = output,
                Err(e) => {
                    self.sink.emit(Event::AgentStep {
                        phase: "fail",
                        agent: step.agent.clone(),
                        detail: Some(e.to_string()),
                    });
                    self.sink.emit(Event::Pipeline {
                        phase: "fail",
                        pipeline: pipeline.to_string(),
                        steps: steps.len(),
                    });
                    return Err(e);
                }
            }
        }

        self.sink.emit(Event::Pipeline {
            phase: "complete",
            pipeline: pipeline.to_string(),
            steps: steps.len(),
        });
        Ok(last_output)
    }

    async fn run_step(&self, step: &PipelineStep) -> Result<String> {
        self.sink.emit(Event::AgentStep {
            phase: "start",
            agent: step.agent.clone(),
            detail: None,
        });

        // (a) Previous output by memory key; absence is fatal.
        let input = self.store.get_value(&step.input_key)?.ok_or_else(|| {
            Error::NotFound(format!(
                "step input '{}' for agent '{}'",
                step.input_key, step.agent
            ))
        })?;
        self.sink.emit(Event::AgentStep {
            phase: "retrieve",
            agent: step.agent.clone(),
            detail: Some(step.input_key.clone()),
        });

        // (b) The prompt names the key it was fed from.
        let prompt = format!(
            "{}\n\nThe previous step's output is stored at memory key '{}':\n{}",
            step.instruction, step.input_key, input
        );

        // (c) Bounded execution with transient-error retries.
        let output = self.run_with_retries(step, prompt).await?;

        // (d) Store and verify by read-back content hash.
        self.store.put_value(&step.output_key, &output)?;
        let read_back = self.store.get_value(&step.output_key)?.unwrap_or_default();
        if content_hash(&read_back) != content_hash(&output) {
            return Err(Error::WriteVerificationFailed {
                key: step.output_key.clone(),
            });
        }
        self.sink.emit(Event::AgentStep {
            phase: "store",
            agent: step.agent.clone(),
            detail: Some(step.output_key.clone()),
        });

        // (e) Quality gate.
        let score = (self.quality)(&output).clamp(0.0, 1.0);
        if score < step.quality_threshold {
            return Err(Error::QualityGateFailed {
                step: step.agent.clone(),
                score,
                threshold: step.quality_threshold,
            });
        }

        self.sink.emit(Event::AgentStep {
            phase: "complete",
            agent: step.agent.clone(),
            detail: None,
        });
        Ok(output)
    }

    async fn run_with_retries(&self, step: &PipelineStep, prompt: String) -> Result<String> {
        let deadline = Duration::from_millis(step.timeout_ms);
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let backoff = self.retry.base_delay_ms << (attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let run = Arc::clone(&self.runner).run(step.agent.clone(), prompt.clone());
            match tokio::time::timeout(deadline, run).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(agent = %step.agent, attempt, error = %e, "retrying step");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    let timeout = Error::TimeoutExceeded {
                        operation: format!("agent '{}'", step.agent),
                        elapsed_ms: step.timeout_ms,
                        budget_ms: step.timeout_ms,
                    };
                    if attempt + 1 < self.retry.max_attempts {
                        tracing::warn!(agent = %step.agent, attempt, "step timed out, retrying");
                        last_error = Some(timeout);
                    } else {
                        return Err(timeout);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Internal("retry loop exited without an error".into())))
    }
}

fn content_hash(content: &str) -> [u8; 32] {
    Sha256::digest(content.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::InMemoryKnowledgeStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted agent: echoes, optionally failing the first N attempts.
    struct ScriptedRunner {
        transient_failures: AtomicU32,
        hang: bool,
    }

    impl ScriptedRunner {
        fn echo() -> Arc<Self> {
            Arc::new(Self {
                transient_failures: AtomicU32::new(0),
                hang: false,
            })
        }

        fn flaky(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                transient_failures: AtomicU32::new(failures),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                transient_failures: AtomicU32::new(0),
                hang: true,
            })
        }
    }

    impl AgentRunner for ScriptedRunner {
        fn run(self: Arc<Self>, agent: String, prompt: String) -> BoxFuture<Result<String>> {
            Box::pin(async move {
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                if self.transient_failures.load(Ordering::SeqCst) > 0 {
                    self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::io(
                        "agent socket",
                        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
                    ));
                }
                Ok(format!("[{agent}] {}", prompt.len()))
            })
        }
    }

    fn step(agent: &str, input_key: &str, output_key: &str, threshold: f32) -> PipelineStep {
        PipelineStep {
            agent: agent.into(),
            input_key: input_key.into(),
            output_key: output_key.into(),
            instruction: format!("act as {agent}"),
            timeout_ms: 200,
            quality_threshold: threshold,
        }
    }

    fn pass_gate() -> QualityGate {
        Arc::new(|_| 1.0)
    }

    #[tokio::test]
    async fn pipeline_chains_outputs_through_memory_keys() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let relay = RelayOrchestrator::new(
            Arc::clone(&store),
            ScriptedRunner::echo(),
            pass_gate(),
            EventSink::new(),
        );

        let steps = vec![
            step("planner", "task:input", "planner:out", 0.5),
            step("coder", "planner:out", "coder:out", 0.5),
        ];

        let output = relay
            .run_pipeline("build", "write a parser", &steps)
            .await
            .unwrap();

        assert!(output.starts_with("[coder]"));
        // Both outputs landed at their declared keys.
        assert!(store.get_value("planner:out").unwrap().is_some());
        assert_eq!(store.get_value("coder:out").unwrap().unwrap(), output);
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let relay = RelayOrchestrator::new(
            store,
            ScriptedRunner::echo(),
            pass_gate(),
            EventSink::new(),
        );

        // Step two reads a key no step wrote.
        let steps = vec![
            step("planner", "task:input", "planner:out", 0.5),
            step("coder", "wrong:key", "coder:out", 0.5),
        ];

        let err = relay.run_pipeline("build", "x", &steps).await.unwrap_err();
        assert_eq!(err.code(), "SONA-018");
    }

    #[tokio::test]
    async fn quality_gate_failure_aborts() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let gate: QualityGate = Arc::new(|_| 0.2);
        let relay =
            RelayOrchestrator::new(store, ScriptedRunner::echo(), gate, EventSink::new());

        let steps = vec![step("planner", "in", "out", 0.8)];
        let err = relay.run_pipeline("p", "x", &steps).await.unwrap_err();
        assert_eq!(err.code(), "SONA-009");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let relay = RelayOrchestrator::new(
            store,
            ScriptedRunner::flaky(2),
            pass_gate(),
            EventSink::new(),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        });

        let steps = vec![step("planner", "in", "out", 0.5)];
        assert!(relay.run_pipeline("p", "x", &steps).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let relay = RelayOrchestrator::new(
            store,
            ScriptedRunner::flaky(10),
            pass_gate(),
            EventSink::new(),
        )
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
        });

        let steps = vec![step("planner", "in", "out", 0.5)];
        let err = relay.run_pipeline("p", "x", &steps).await.unwrap_err();
        assert_eq!(err.code(), "SONA-015");
    }

    #[tokio::test]
    async fn step_timeout_is_typed() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let relay = RelayOrchestrator::new(
            store,
            ScriptedRunner::hanging(),
            pass_gate(),
            EventSink::new(),
        )
        .with_retry(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
        });

        let mut hanging_step = step("planner", "in", "out", 0.5);
        hanging_step.timeout_ms = 50;
        let err = relay
            .run_pipeline("p", "x", &[hanging_step])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SONA-007");
    }

    #[tokio::test]
    async fn step_events_trace_the_lifecycle() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let (sink, rx) = EventSink::with_channel(64);
        let relay = RelayOrchestrator::new(store, ScriptedRunner::echo(), pass_gate(), sink);

        let steps = vec![step("planner", "in", "out", 0.5)];
        relay.run_pipeline("p", "x", &steps).await.unwrap();

        let phases: Vec<String> = rx
            .try_iter()
            .map(|e| match e {
                Event::Pipeline { phase, .. } => format!("pipeline:{phase}"),
                Event::AgentStep { phase, .. } => format!("agent:{phase}"),
                other => other.name().to_string(),
            })
            .collect();

        assert_eq!(
            phases,
            vec![
                "pipeline:start",
                "agent:start",
                "agent:retrieve",
                "agent:store",
                "agent:complete",
                "pipeline:complete",
            ]
        );
    }
}
