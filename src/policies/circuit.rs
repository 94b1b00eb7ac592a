//! Process-wide circuit breakers keyed by task id.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// Breaker thresholds, shared by every task the registry tracks.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures inside `window` before the circuit opens.
    pub failure_threshold: u32,
    /// Rolling window in which failures count as consecutive.
    pub window: Duration,
    /// Time spent open before a single probe is allowed through.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state, mostly for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    /// Normal operation; counts consecutive failures toward the threshold.
    Closed {
        consecutive_failures: u32,
        window_start: Option<Instant>,
    },
    /// Tripped; invocations short-circuit until `cooldown` elapses.
    Open { opened_at: Instant },
    /// One probe in flight; its outcome decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: State,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: State::Closed {
                consecutive_failures: 0,
                window_start: None,
            },
        }
    }

    /// Whether an invocation may proceed. Open transitions to half-open
    /// once the cooldown has elapsed, letting exactly one probe through.
    fn try_acquire(&mut self, config: &CircuitBreakerConfig) -> bool {
        match &self.state {
            State::Closed { .. } | State::HalfOpen => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= config.cooldown {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = State::Closed {
            consecutive_failures: 0,
            window_start: None,
        };
    }

    fn record_failure(&mut self, config: &CircuitBreakerConfig) {
        match &self.state {
            State::Closed {
                consecutive_failures,
                window_start,
            } => {
                let now = Instant::now();
                // Failures outside the window restart the count.
                let (count, start) = match window_start {
                    Some(start) if now.duration_since(*start) <= config.window => {
                        (consecutive_failures + 1, *start)
                    }
                    _ => (1, now),
                };
                if count >= config.failure_threshold {
                    self.state = State::Open { opened_at: now };
                } else {
                    self.state = State::Closed {
                        consecutive_failures: count,
                        window_start: Some(start),
                    };
                }
            }
            State::HalfOpen => {
                self.state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    fn observe(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

/// Registry of breakers keyed by `task_id`, scoped to the process.
///
/// The scheduler consults this before every attempt; while a task's
/// circuit is open, invocations short-circuit with `CircuitOpen` without
/// touching the task at all.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<FxHashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Whether an invocation of `task_id` may proceed right now.
    pub fn try_acquire(&self, task_id: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(task_id.to_string())
            .or_insert_with(Breaker::new)
            .try_acquire(&self.config)
    }

    pub fn record_success(&self, task_id: &str) {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(task_id.to_string())
            .or_insert_with(Breaker::new)
            .record_success();
    }

    pub fn record_failure(&self, task_id: &str) {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(task_id.to_string())
            .or_insert_with(Breaker::new)
            .record_failure(&self.config);
    }

    /// Current state of a task's breaker (`Closed` if never used).
    pub fn state_of(&self, task_id: &str) -> BreakerState {
        let breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .get(task_id)
            .map_or(BreakerState::Closed, Breaker::observe)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
