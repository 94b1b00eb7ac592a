//! Executable units and their runtime context.
//!
//! A [`Task`] is a value-like unit of work identified by a stable
//! `task_id`, reusable across flows. It declares input/output [`Schema`]s,
//! an async `execute` capability, and optionally a `compensate` capability
//! that undoes its effect when a later node fails terminally.
//!
//! [`TaskContext`] is constructed fresh for every attempt and gives the
//! task read access to prior node outputs, read/write access to the
//! execution's scratch variables, and the cooperative cancel signal.
//!
//! Most callers never implement the trait directly: [`task_fn`] wraps a
//! closure into a [`FnTask`], which is how the integration tests and demos
//! build their flows.
//!
//! # Examples
//!
//! ```
//! use rillflow::schema::Schema;
//! use rillflow::task::{task_fn, TaskError};
//! use serde_json::json;
//!
//! let double = task_fn(
//!     "double",
//!     Schema::object([("value", Schema::Integer)]),
//!     Schema::object([("result", Schema::Integer)]),
//!     |input, _ctx| async move {
//!         let v = input["value"].as_i64().ok_or_else(|| TaskError::msg("not a number"))?;
//!         Ok(json!({"result": v * 2}))
//!     },
//! );
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::policies::RetryPolicy;
use crate::schema::Schema;

/// Fatal failure of a task's `execute` or `compensate` capability.
///
/// Returning an error ends the attempt; whether the node is retried is
/// the retry policy's decision, not the task's.
#[derive(Debug, Error, Diagnostic)]
pub enum TaskError {
    #[error("{message}")]
    #[diagnostic(code(rillflow::task::failed))]
    Failed { message: String, detail: Value },

    /// Expected data was missing from the input payload.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(rillflow::task::missing_input),
        help("Check that the upstream node produced the required field.")
    )]
    MissingInput { what: &'static str },

    #[error(transparent)]
    #[diagnostic(code(rillflow::task::serde))]
    Serde(#[from] serde_json::Error),
}

impl TaskError {
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(message: impl Into<String>, detail: Value) -> Self {
        TaskError::Failed {
            message: message.into(),
            detail,
        }
    }

    /// Structured detail for persistence in task-result records.
    #[must_use]
    pub fn detail(&self) -> Value {
        match self {
            TaskError::Failed { detail, .. } => detail.clone(),
            _ => Value::Null,
        }
    }
}

/// Sender half of the cooperative cancel signal.
///
/// Held by the scheduler; firing it asks every in-flight attempt of the
/// execution to stop at its next suspension point. There is no hard kill.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Subscribe a new signal observer.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half of the cooperative cancel signal, carried by
/// [`TaskContext`]. Tasks doing long work should poll it at reasonable
/// intervals.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires; useful in tests.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested (or the handle is gone).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Scratch-variable view for one attempt: reads see the execution's
/// variables overlaid with this attempt's own writes; writes are collected
/// as a delta and merged by the scheduler only if the attempt succeeds.
#[derive(Debug, Default)]
pub(crate) struct VariableScope {
    base: BTreeMap<String, Value>,
    writes: Mutex<BTreeMap<String, Value>>,
}

impl VariableScope {
    pub(crate) fn new(base: BTreeMap<String, Value>) -> Self {
        Self {
            base,
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        let writes = self.writes.lock().expect("variable scope poisoned");
        writes.get(key).or_else(|| self.base.get(key)).cloned()
    }

    fn set(&self, key: String, value: Value) {
        self.writes
            .lock()
            .expect("variable scope poisoned")
            .insert(key, value);
    }

    pub(crate) fn take_writes(&self) -> BTreeMap<String, Value> {
        std::mem::take(&mut self.writes.lock().expect("variable scope poisoned"))
    }
}

/// Execution context passed to every `execute` and `compensate` call.
///
/// Constructed per attempt; `attempt` is 1-based.
#[derive(Clone, Debug)]
pub struct TaskContext {
    flow_id: String,
    execution_id: String,
    node_id: String,
    attempt: u32,
    outputs: Arc<BTreeMap<String, Value>>,
    variables: Arc<VariableScope>,
    cancel: CancelSignal,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: String,
        execution_id: String,
        node_id: String,
        attempt: u32,
        outputs: Arc<BTreeMap<String, Value>>,
        variables: Arc<VariableScope>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            flow_id,
            execution_id,
            node_id,
            attempt,
            outputs,
            variables,
            cancel,
        }
    }

    #[must_use]
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Compile-time path of the node this attempt runs under.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Output of a previously completed node, by output key.
    #[must_use]
    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// Read a scratch variable (this attempt's writes shadow older values).
    #[must_use]
    pub fn variable(&self, key: &str) -> Option<Value> {
        self.variables.get(key)
    }

    /// Write a scratch variable. The write becomes visible to later nodes
    /// only if this attempt succeeds.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.set(key.into(), value);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when cancellation is requested; long-running tasks should
    /// select against this.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// An executable unit of work.
///
/// Tasks are shared immutable (`Send + Sync`) and must be idempotent
/// across attempts from the engine's perspective: a resumed execution
/// re-runs any node that was in flight when the snapshot was taken.
/// Non-idempotent side effects belong behind `compensate`, not replay.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable identifier, unique within any flow that references the task.
    fn id(&self) -> &str;

    fn description(&self) -> String {
        format!("Task {}", self.id())
    }

    fn input_schema(&self) -> Schema;

    fn output_schema(&self) -> Schema;

    async fn execute(&self, input: Value, ctx: &TaskContext) -> Result<Value, TaskError>;

    /// Whether this task declares a compensation capability.
    fn has_compensation(&self) -> bool {
        false
    }

    /// Undo this task's effect given the output it produced. Only invoked
    /// when [`has_compensation`](Self::has_compensation) returns true.
    async fn compensate(&self, _output: Value, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// Per-attempt deadline. Exceeding it cancels the attempt and counts
    /// as a `Timeout` failure for the retry policy.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Task-specific retry policy; `None` inherits the flow default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

type ExecuteFn =
    dyn Fn(Value, TaskContext) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync;
type CompensateFn =
    dyn Fn(Value, TaskContext) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync;

/// A [`Task`] backed by closures; see [`task_fn`].
#[derive(Clone)]
pub struct FnTask {
    id: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
    execute: Arc<ExecuteFn>,
    compensate: Option<Arc<CompensateFn>>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

/// Build a task from an async closure.
pub fn task_fn<F, Fut>(
    id: impl Into<String>,
    input_schema: Schema,
    output_schema: Schema,
    execute: F,
) -> FnTask
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    FnTask {
        id: id.into(),
        description: None,
        input_schema,
        output_schema,
        execute: Arc::new(move |input, ctx| Box::pin(execute(input, ctx))),
        compensate: None,
        timeout: None,
        retry: None,
    }
}

impl FnTask {
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a compensation closure, marking the task as compensatable.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |output, ctx| Box::pin(compensate(output, ctx))));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[async_trait]
impl Task for FnTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Task {}", self.id))
    }

    fn input_schema(&self) -> Schema {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> Schema {
        self.output_schema.clone()
    }

    async fn execute(&self, input: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        (self.execute)(input, ctx.clone()).await
    }

    fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    async fn compensate(&self, output: Value, ctx: &TaskContext) -> Result<(), TaskError> {
        match &self.compensate {
            Some(f) => f(output, ctx.clone()).await,
            None => Ok(()),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry.clone()
    }
}

impl std::fmt::Debug for FnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask")
            .field("id", &self.id)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("has_compensation", &self.compensate.is_some())
            .finish_non_exhaustive()
    }
}
