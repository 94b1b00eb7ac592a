//! Failure policies consulted by the scheduler.
//!
//! Retry policies are attached per task (or inherited from the scheduler's
//! flow default) and decide whether a failed attempt is re-run and after
//! what delay. Circuit breakers are keyed by `task_id` and scoped
//! process-wide, shielding a task shared by many flows once it starts
//! failing consistently. Compensation has no policy object of its own: it
//! is a capability declared on the task and driven by the scheduler in
//! reverse completion order.

mod circuit;
mod retry;

pub use circuit::{BreakerState, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use retry::{Backoff, Jitter, RetryPolicy};
