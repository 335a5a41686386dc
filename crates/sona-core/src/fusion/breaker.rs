//! Circuit breaker for the GNN pre-search hook.
//!
//! Five consecutive failures open the breaker; while open the raw
//! embedding is used unchanged. After the reset timeout a trial call is
//! let through (half-open); two consecutive successes close the breaker,
//! any failure reopens it.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const FAILURES_TO_OPEN: u32 = 5;
const SUCCESSES_TO_CLOSE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { consecutive_successes: u32 },
}

/// Point-in-time breaker observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSnapshot {
    /// Calls pass through.
    Closed,
    /// Calls are skipped.
    Open,
    /// A trial call is in progress.
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given reset timeout.
    #[must_use]
    pub fn new(reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            reset_timeout,
        }
    }

    /// Whether the guarded call should be attempted right now.
    ///
    /// An open breaker transitions to half-open once the reset timeout has
    /// elapsed, letting one trial call through.
    #[must_use]
    pub fn allows(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.reset_timeout {
                    *state = State::HalfOpen {
                        consecutive_successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful guarded call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            State::Closed { .. } => State::Closed {
                consecutive_failures: 0,
            },
            State::HalfOpen {
                consecutive_successes,
            } => {
                if consecutive_successes + 1 >= SUCCESSES_TO_CLOSE {
                    State::Closed {
                        consecutive_failures: 0,
                    }
                } else {
                    State::HalfOpen {
                        consecutive_successes: consecutive_successes + 1,
                    }
                }
            }
            open @ State::Open { .. } => open,
        };
    }

    /// Records a failed guarded call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            State::Closed {
                consecutive_failures,
            } => {
                if consecutive_failures + 1 >= FAILURES_TO_OPEN {
                    State::Open {
                        since: Instant::now(),
                    }
                } else {
                    State::Closed {
                        consecutive_failures: consecutive_failures + 1,
                    }
                }
            }
            State::HalfOpen { .. } => State::Open {
                since: Instant::now(),
            },
            open @ State::Open { .. } => open,
        };
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        match *self.state.lock() {
            State::Closed { .. } => BreakerSnapshot::Closed,
            State::Open { .. } => BreakerSnapshot::Open,
            State::HalfOpen { .. } => BreakerSnapshot::HalfOpen,
        }
    }
}
