//! Per-task retry configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::errors::ErrorKind;

/// Delay strategy between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `base + step * (failed_attempts - 1)`.
    Linear { base: Duration, step: Duration },
    /// `base * factor^(failed_attempts - 1)`, clamped to `cap`.
    Exponential {
        base: Duration,
        factor: f64,
        cap: Duration,
    },
}

/// Jitter applied to a computed delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
    #[default]
    None,
    /// Uniform in `[0, computed_delay]`.
    Full,
}

/// Retry policy for a task.
///
/// `max_attempts` counts every started attempt, including the first;
/// `max_attempts = 1` therefore means "no retries". Cancelled attempts do
/// not consume budget. The `retry_on` predicate filters by [`ErrorKind`]
/// and defaults to everything except `Cancelled` and `ValidationError`
/// (`CircuitOpen` is additionally never retried by the scheduler).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rillflow::policies::{Backoff, Jitter, RetryPolicy};
///
/// let policy = RetryPolicy::new(
///     3,
///     Backoff::Exponential {
///         base: Duration::from_millis(100),
///         factor: 2.0,
///         cap: Duration::from_secs(5),
///     },
/// )
/// .with_jitter(Jitter::None);
///
/// assert_eq!(policy.delay_after(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_after(2), Duration::from_millis(200));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    strategy: Backoff,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            jitter: Jitter::None,
            retry_on: Arc::new(default_retry_on),
        }
    }

    /// Single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the error-kind filter.
    #[must_use]
    pub fn retry_on(mut self, predicate: impl Fn(ErrorKind) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt should be scheduled after `attempt` (1-based)
    /// failed with `kind`.
    #[must_use]
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retry_on)(kind)
    }

    /// Raw delay after the given failed attempt (1-based), before jitter.
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        match &self.strategy {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear { base, step } => *base + *step * (n - 1),
            Backoff::Exponential { base, factor, cap } => {
                let scaled = base.as_secs_f64() * factor.powi(n as i32 - 1);
                Duration::from_secs_f64(scaled).min(*cap)
            }
        }
    }

    /// Delay with jitter applied; this is what the scheduler sleeps for.
    #[must_use]
    pub fn sleep_after(&self, failed_attempt: u32) -> Duration {
        let delay = self.delay_after(failed_attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => {
                if delay.is_zero() {
                    delay
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..=delay)
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

fn default_retry_on(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::Cancelled | ErrorKind::ValidationError | ErrorKind::CircuitOpen
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_grows_by_step() {
        let policy = RetryPolicy::new(
            5,
            Backoff::Linear {
                base: Duration::from_millis(50),
                step: Duration::from_millis(25),
            },
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(3), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_caps() {
        let policy = RetryPolicy::new(
            10,
            Backoff::Exponential {
                base: Duration::from_millis(100),
                factor: 2.0,
                cap: Duration::from_millis(300),
            },
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(7), Duration::from_millis(300));
    }

    #[test]
    fn budget_counts_the_first_attempt() {
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::ZERO));
        assert!(policy.should_retry(ErrorKind::TaskError, 1));
        assert!(policy.should_retry(ErrorKind::TaskError, 2));
        assert!(!policy.should_retry(ErrorKind::TaskError, 3));
    }

    #[test]
    fn default_filter_skips_non_retryable_kinds() {
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::ZERO));
        assert!(!policy.should_retry(ErrorKind::Cancelled, 1));
        assert!(!policy.should_retry(ErrorKind::ValidationError, 1));
        assert!(!policy.should_retry(ErrorKind::CircuitOpen, 1));
        assert!(policy.should_retry(ErrorKind::Timeout, 1));
    }

    #[test]
    fn full_jitter_stays_within_delay() {
        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(80)))
            .with_jitter(Jitter::Full);
        for _ in 0..32 {
            assert!(policy.sleep_after(1) <= Duration::from_millis(80));
        }
    }
}
