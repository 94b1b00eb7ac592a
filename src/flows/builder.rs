//! The fluent composition builder.
//!
//! Each operation appends one pending node and returns the builder for
//! chaining, matching the shape of the eventual plan one-to-one. Nothing
//! is validated until [`FlowBuilder::compile`], so composition order reads
//! top-to-bottom without intermediate `Result`s.
//!
//! # Examples
//!
//! ```
//! use rillflow::flows::{flow, when, Subflow};
//! use rillflow::schema::Schema;
//! use rillflow::task::{task_fn, TaskError};
//! use serde_json::json;
//!
//! let double = task_fn(
//!     "double",
//!     Schema::object([("value", Schema::Integer)]),
//!     Schema::object([("result", Schema::Integer), ("value", Schema::Integer)]),
//!     |input, _| async move {
//!         let v = input["value"].as_i64().ok_or_else(|| TaskError::msg("no value"))?;
//!         Ok(json!({"result": v * 2, "value": v * 2}))
//!     },
//! );
//!
//! let compiled = flow("doubler")
//!     .description("double twice")
//!     .then(double.clone())
//!     .then(double)
//!     .compile(Schema::object([("value", Schema::Integer)]));
//! assert!(compiled.is_ok());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::plan::Predicate;
use crate::task::Task;

use super::Flow;

/// Default iteration cap for `while_`, mirroring the loop safety valve of
/// the composition API: hitting it ends the loop with a warning rather
/// than spinning forever on a predicate that never fails.
pub(super) const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Wrap a closure as a branch/while predicate.
#[must_use]
pub fn when<F>(predicate: F) -> Predicate
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}

/// Either a single task or a nested sequence, accepted wherever an
/// operator takes a sub-plan.
pub enum Subflow {
    Task(Arc<dyn Task>),
    Sequence(FlowBuilder),
}

impl Subflow {
    /// A single-task sub-plan.
    #[must_use]
    pub fn step(task: impl Task + 'static) -> Self {
        Subflow::Task(Arc::new(task))
    }
}

impl<T: Task + 'static> From<T> for Subflow {
    fn from(task: T) -> Self {
        Subflow::Task(Arc::new(task))
    }
}

impl From<FlowBuilder> for Subflow {
    fn from(builder: FlowBuilder) -> Self {
        Subflow::Sequence(builder)
    }
}

pub(super) enum PendingNode {
    Then(Arc<dyn Task>),
    Branch(Vec<(Predicate, Subflow)>),
    Parallel(Vec<Subflow>),
    While {
        predicate: Predicate,
        body: Box<Subflow>,
        max_iterations: u32,
    },
    ForEach {
        body: Box<Subflow>,
        concurrency: usize,
    },
    Nested(Arc<Flow>),
}

/// Fluent builder for a [`Flow`].
///
/// Created by [`flow`]; terminated by [`compile`](Self::compile).
pub struct FlowBuilder {
    pub(super) id: String,
    pub(super) description: Option<String>,
    pub(super) metadata: BTreeMap<String, Value>,
    pub(super) steps: Vec<PendingNode>,
}

/// Start composing a flow with the given id.
#[must_use]
pub fn flow(id: impl Into<String>) -> FlowBuilder {
    FlowBuilder {
        id: id.into(),
        description: None,
        metadata: BTreeMap::new(),
        steps: Vec::new(),
    }
}

/// An anonymous sequence used as a sub-plan.
#[must_use]
pub fn sequence() -> FlowBuilder {
    flow("")
}

impl FlowBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an opaque metadata label (tenant, trace id, …) carried onto
    /// every execution of this flow.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Append a sequential step.
    #[must_use]
    pub fn then(mut self, task: impl Task + 'static) -> Self {
        self.steps.push(PendingNode::Then(Arc::new(task)));
        self
    }

    /// Append a conditional branch; the first arm whose predicate matches
    /// the current value runs.
    #[must_use]
    pub fn branch(mut self, arms: Vec<(Predicate, Subflow)>) -> Self {
        self.steps.push(PendingNode::Branch(arms));
        self
    }

    /// Append a fan-out: every arm receives the current value, and the
    /// node yields the arm outputs in declared order.
    #[must_use]
    pub fn parallel(mut self, arms: Vec<Subflow>) -> Self {
        self.steps.push(PendingNode::Parallel(arms));
        self
    }

    /// Append a loop that re-runs `body` while `predicate` holds, with the
    /// default iteration cap.
    #[must_use]
    pub fn while_(self, predicate: Predicate, body: impl Into<Subflow>) -> Self {
        self.while_bounded(predicate, body, DEFAULT_MAX_ITERATIONS)
    }

    /// [`while_`](Self::while_) with an explicit iteration cap.
    #[must_use]
    pub fn while_bounded(
        mut self,
        predicate: Predicate,
        body: impl Into<Subflow>,
        max_iterations: u32,
    ) -> Self {
        self.steps.push(PendingNode::While {
            predicate,
            body: Box::new(body.into()),
            max_iterations,
        });
        self
    }

    /// Append a per-element map over the current sequence, one element at
    /// a time.
    #[must_use]
    pub fn for_each(self, body: impl Into<Subflow>) -> Self {
        self.for_each_concurrent(1, body)
    }

    /// [`for_each`](Self::for_each) with a concurrency bound.
    #[must_use]
    pub fn for_each_concurrent(mut self, concurrency: usize, body: impl Into<Subflow>) -> Self {
        self.steps.push(PendingNode::ForEach {
            body: Box::new(body.into()),
            concurrency: concurrency.max(1),
        });
        self
    }

    /// Append a child flow as an opaque node; it runs as a linked
    /// sub-execution with its own execution id.
    #[must_use]
    pub fn nested(mut self, flow: Arc<Flow>) -> Self {
        self.steps.push(PendingNode::Nested(flow));
        self
    }
}
