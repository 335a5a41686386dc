//! EWC++-regularized routing learner.
//!
//! Keeps one routing weight and one Fisher-information proxy per agent,
//! updated from task feedback. Only successes and routing-attributed
//! failures move the weights; agent failures and impossible tasks touch
//! the reliability counters and the rolling accuracy window instead.
//!
//! Callers must serialize `process_feedback`; the learner is
//! single-threaded by design and the `&mut` receiver enforces it.

use crate::config::RoutingConfig;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAttribution {
    /// The wrong agent was selected; routing weights should move.
    RoutingFailure,
    /// The right agent was selected but executed poorly.
    AgentFailure,
    /// No agent could have solved this task.
    TaskImpossible,
    /// Not a failure, or no attribution available.
    None,
}

/// One piece of task feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingFeedback {
    /// Agent the task was routed to.
    pub agent: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// Optional user rating, 1..=5.
    pub user_rating: Option<u8>,
    /// The user manually overrode the agent selection.
    pub user_overrode_selection: bool,
    /// Failure attribution (ignored on success).
    pub attribution: FailureAttribution,
}

/// Snapshot of weights, importance and accuracy at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Weight per agent.
    pub weights: FxHashMap<String, f32>,
    /// Importance per agent.
    pub importance: FxHashMap<String, f32>,
    /// Rolling accuracy when the checkpoint was taken.
    pub accuracy: f32,
}

/// Per-agent execution reliability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reliability {
    /// Successful executions.
    pub successes: u32,
    /// Failed executions (agent-attributed or impossible).
    pub failures: u32,
}

/// What one feedback did to the learner.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackOutcome {
    /// Signed weight change applied to the agent (zero when the update was
    /// not authorized or a rollback fired instead).
    pub weight_delta: f32,
    /// Whether degradation triggered a checkpoint rollback.
    pub rolled_back: bool,
    /// Rolling accuracy after this feedback.
    pub accuracy: f32,
}

/// Per-agent routing weights with EWC++ regularization and automatic
/// rollback on accuracy degradation.
pub struct RoutingLearner {
    config: RoutingConfig,
    weights: FxHashMap<String, f32>,
    importance: FxHashMap<String, f32>,
    reliability: FxHashMap<String, Reliability>,
    history: VecDeque<u8>,
    checkpoint: Option<Checkpoint>,
}

/// Weight assigned to agents that have never received feedback.
const INITIAL_WEIGHT: f32 = 0.5;

impl RoutingLearner {
    /// Creates an empty learner.
    #[must_use]
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            weights: FxHashMap::default(),
            importance: FxHashMap::default(),
            reliability: FxHashMap::default(),
            history: VecDeque::new(),
            checkpoint: None,
        }
    }

    /// Routing weight for an agent.
    #[must_use]
    pub fn weight(&self, agent: &str) -> f32 {
        self.weights.get(agent).copied().unwrap_or(INITIAL_WEIGHT)
    }

    /// Importance (Fisher proxy) for an agent.
    #[must_use]
    pub fn importance(&self, agent: &str) -> f32 {
        self.importance.get(agent).copied().unwrap_or(0.0)
    }

    /// Reliability counters for an agent.
    #[must_use]
    pub fn reliability(&self, agent: &str) -> Reliability {
        self.reliability.get(agent).copied().unwrap_or_default()
    }

    /// All known weights.
    #[must_use]
    pub fn weights(&self) -> &FxHashMap<String, f32> {
        &self.weights
    }

    /// Rolling accuracy over the history window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn current_accuracy(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let sum: u32 = self.history.iter().map(|&v| u32::from(v)).sum();
        sum as f32 / self.history.len() as f32
    }

    /// The latest checkpoint, if any update has been authorized yet.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Applies one piece of feedback.
    ///
    /// Order of effects: the accuracy window always takes the sample;
    /// degradation beyond the threshold restores the checkpoint (keeping
    /// the window); otherwise an authorized update snapshots a fresh
    /// checkpoint and moves the weight under the EWC++ rule.
    ///
    /// # Errors
    ///
    /// Rejects ratings outside 1..=5.
    pub fn process_feedback(&mut self, feedback: &RoutingFeedback) -> Result<FeedbackOutcome> {
        if let Some(rating) = feedback.user_rating {
            if !(1..=5).contains(&rating) {
                return Err(Error::InvalidInput(format!(
                    "user rating {rating} outside 1..=5"
                )));
            }
        }

        // 1. Rolling accuracy, regardless of attribution.
        self.history.push_back(u8::from(feedback.success));
        while self.history.len() > self.config.accuracy_window {
            self.history.pop_front();
        }
        let accuracy = self.current_accuracy();

        // 2. Reliability counters.
        let reliability = self.reliability.entry(feedback.agent.clone()).or_default();
        if feedback.success {
            reliability.successes += 1;
        } else if matches!(
            feedback.attribution,
            FailureAttribution::AgentFailure | FailureAttribution::TaskImpossible
        ) {
            reliability.failures += 1;
        }

        // 3. Degradation rollback, before any further weight movement.
        if self.should_roll_back(accuracy) {
            if let Some(checkpoint) = &self.checkpoint {
                self.weights = checkpoint.weights.clone();
                self.importance = checkpoint.importance.clone();
                tracing::info!(
                    checkpoint_accuracy = checkpoint.accuracy,
                    current_accuracy = accuracy,
                    "routing weights rolled back to checkpoint"
                );
            }
            return Ok(FeedbackOutcome {
                weight_delta: 0.0,
                rolled_back: true,
                accuracy,
            });
        }

        // 4. Only successes and routing-attributed failures move weights.
        let authorized = feedback.success
            || matches!(feedback.attribution, FailureAttribution::RoutingFailure);
        if !authorized {
            return Ok(FeedbackOutcome {
                weight_delta: 0.0,
                rolled_back: false,
                accuracy,
            });
        }

        let reward = Self::reward(feedback);
        let agent = feedback.agent.clone();
        let old_weight = self.weight(&agent);
        let agent_importance = self.importance(&agent);

        // The EWC penalty anchors against the previous checkpoint; the
        // fresh checkpoint below is what a later rollback restores.
        let anchor = self
            .checkpoint
            .as_ref()
            .and_then(|c| c.weights.get(&agent).copied())
            .unwrap_or(old_weight);

        self.checkpoint = Some(Checkpoint {
            weights: self.weights.clone(),
            importance: self.importance.clone(),
            accuracy,
        });

        let delta_raw = self.config.learning_rate * reward;
        let penalty = self.config.ewc_lambda * agent_importance * (old_weight - anchor);
        let delta_eff =
            (delta_raw - penalty).clamp(-self.config.max_delta, self.config.max_delta);

        let new_weight = (old_weight + delta_eff).clamp(0.0, 1.0);
        self.weights.insert(agent.clone(), new_weight);
        *self.importance.entry(agent).or_insert(0.0) += reward * reward;

        Ok(FeedbackOutcome {
            weight_delta: new_weight - old_weight,
            rolled_back: false,
            accuracy,
        })
    }

    /// Reward shaping: sign from success, magnitude from the user rating;
    /// a user override of a "successful" selection still counts against
    /// the router.
    fn reward(feedback: &RoutingFeedback) -> f32 {
        if feedback.user_overrode_selection && feedback.success {
            return -0.5;
        }
        let magnitude = feedback
            .user_rating
            .map_or(1.0, |rating| f32::from(rating) / 5.0);
        if feedback.success {
            magnitude
        } else {
            -magnitude
        }
    }

    fn should_roll_back(&self, accuracy: f32) -> bool {
        if self.history.len() < self.config.min_history {
            return false;
        }
        self.checkpoint
            .as_ref()
            .is_some_and(|c| c.accuracy - accuracy > self.config.degradation_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> RoutingLearner {
        RoutingLearner::new(RoutingConfig::default())
    }

    fn success(agent: &str) -> RoutingFeedback {
        RoutingFeedback {
            agent: agent.into(),
            success: true,
            user_rating: None,
            user_overrode_selection: false,
            attribution: FailureAttribution::None,
        }
    }

    fn failure(agent: &str, attribution: FailureAttribution) -> RoutingFeedback {
        RoutingFeedback {
            agent: agent.into(),
            success: false,
            user_rating: None,
            user_overrode_selection: false,
            attribution,
        }
    }

    #[test]
    fn repeated_success_is_stable() {
        // 100 identical successes: weight climbs, never leaves [0, 1],
        // and no single update moves more than the clip.
        let mut learner = learner();
        let mut previous = learner.weight("coder");
        assert!((previous - 0.5).abs() < f32::EPSILON);

        for _ in 0..100 {
            let outcome = learner.process_feedback(&success("coder")).unwrap();
            assert!(!outcome.rolled_back);
            let current = learner.weight("coder");
            assert!((current - previous).abs() <= 0.05 + 1e-6);
            assert!((0.0..=1.0).contains(&current));
            previous = current;
        }

        assert!(learner.weight("coder") >= 0.5);
        assert!(learner.importance("coder") > 0.0);
    }

    #[test]
    fn only_routing_failures_move_weights() {
        let mut learner = learner();

        let outcome = learner
            .process_feedback(&failure("coder", FailureAttribution::AgentFailure))
            .unwrap();
        assert_eq!(outcome.weight_delta, 0.0);
        assert!((learner.weight("coder") - 0.5).abs() < f32::EPSILON);
        assert_eq!(learner.reliability("coder").failures, 1);

        let outcome = learner
            .process_feedback(&failure("coder", FailureAttribution::TaskImpossible))
            .unwrap();
        assert_eq!(outcome.weight_delta, 0.0);
        assert_eq!(learner.reliability("coder").failures, 2);

        let outcome = learner
            .process_feedback(&failure("coder", FailureAttribution::RoutingFailure))
            .unwrap();
        assert!(outcome.weight_delta < 0.0);
        assert!(learner.weight("coder") < 0.5);
        // Routing failures are not agent unreliability.
        assert_eq!(learner.reliability("coder").failures, 2);
    }

    #[test]
    fn user_rating_scales_the_reward() {
        let mut learner = learner();
        let mut rated = success("coder");
        rated.user_rating = Some(2);
        learner.process_feedback(&rated).unwrap();
        let low_rated_delta = learner.weight("coder") - 0.5;

        let mut other = RoutingLearner::new(RoutingConfig::default());
        other.process_feedback(&success("coder")).unwrap();
        let unrated_delta = other.weight("coder") - 0.5;

        assert!(low_rated_delta > 0.0);
        assert!(low_rated_delta < unrated_delta);
    }

    #[test]
    fn override_of_successful_selection_penalizes() {
        let mut learner = learner();
        let mut overridden = success("coder");
        overridden.user_overrode_selection = true;

        learner.process_feedback(&overridden).unwrap();
        assert!(learner.weight("coder") < 0.5);
    }

    #[test]
    fn invalid_rating_is_rejected() {
        let mut learner = learner();
        let mut bad = success("coder");
        bad.user_rating = Some(6);
        assert_eq!(
            learner.process_feedback(&bad).unwrap_err().code(),
            "SONA-013"
        );
    }

    #[test]
    fn accuracy_window_is_bounded() {
        let mut learner = RoutingLearner::new(RoutingConfig {
            accuracy_window: 10,
            ..RoutingConfig::default()
        });

        for _ in 0..10 {
            learner
                .process_feedback(&failure("coder", FailureAttribution::AgentFailure))
                .unwrap();
        }
        assert!((learner.current_accuracy() - 0.0).abs() < f32::EPSILON);

        // Ten successes push every failure out of the window.
        for _ in 0..10 {
            learner.process_feedback(&success("coder")).unwrap();
        }
        assert!((learner.current_accuracy() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn degradation_restores_the_checkpoint_but_keeps_history() {
        let mut learner = learner();

        for _ in 0..20 {
            learner.process_feedback(&success("coder")).unwrap();
        }
        let peak_weight = learner.weight("coder");
        let peak_importance = learner.importance("coder");

        // Accuracy drops from 1.0 to 20/21: past the 2% threshold.
        let outcome = learner
            .process_feedback(&failure("coder", FailureAttribution::RoutingFailure))
            .unwrap();
        assert!(outcome.rolled_back);
        assert!(outcome.accuracy < 1.0);

        // Weights and importance restored to the pre-update checkpoint.
        assert!((learner.weight("coder") - peak_weight).abs() < 0.051);
        assert!(learner.importance("coder") <= peak_importance);
        // History was NOT restored: the failure stays visible.
        assert!(learner.current_accuracy() < 1.0);
    }

    #[test]
    fn checkpoint_precedes_every_authorized_update() {
        let mut learner = learner();
        assert!(learner.checkpoint().is_none());

        learner.process_feedback(&success("coder")).unwrap();
        let checkpoint = learner.checkpoint().unwrap();
        // The checkpoint captured the state before the first update.
        assert!(checkpoint.weights.is_empty());

        learner.process_feedback(&success("coder")).unwrap();
        let checkpoint = learner.checkpoint().unwrap();
        let anchored = checkpoint.weights.get("coder").copied().unwrap();
        assert!(anchored < learner.weight("coder"));
    }
}
