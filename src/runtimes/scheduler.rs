//! The scheduler: drives a compiled plan to a terminal status.
//!
//! One scheduler instance can drive many executions concurrently (bounded
//! by a worker pool), but each execution is advanced by exactly one
//! driver holding the storage lease. Within an execution the only
//! concurrency is between arms of a `parallel` or `for_each` node; two
//! sequential nodes never overlap.
//!
//! The driver appends every state transition to the event log and writes
//! a snapshot after each one that moves the execution record, renewing
//! its lease as it goes. Node attempts are wrapped in the retry policy,
//! the per-task circuit breaker, the optional per-attempt deadline, and
//! the cooperative cancel signal; terminal failures unwind through
//! compensation in reverse completion order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::errors::{ErrorKind, NodeFailure};
use crate::events::{EventBus, EventEmitter, EventRecord, ExecutionEvent};
use crate::flows::Flow;
use crate::plan::{Node, NodeBody, Plan};
use crate::policies::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use crate::schema::{PayloadValidator, ShapeValidator, ValidationFault};
use crate::storage::{
    AttemptStatus, ExecutionFilter, ExecutionPage, Lease, Page, Storage, StorageError,
    TaskResultRecord,
};
use crate::task::{CancelHandle, CancelSignal, Task, TaskContext, VariableScope};

use super::execution::{CompletedNode, Execution, ExecutionStatus, FailedNode};
use super::persistence::{self, PersistenceError};
use super::registry::{FlowRegistry, RegistryError};

/// Scheduler-wide configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Lease owner identity, unique per scheduler instance.
    pub owner: String,
    pub lease_ttl: Duration,
    /// Upper bound on executions driven concurrently by this instance.
    pub max_concurrent_executions: usize,
    /// Retry policy for tasks that do not declare their own.
    pub default_retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            owner: format!(
                "scheduler-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            lease_ttl: Duration::from_secs(30),
            max_concurrent_executions: workers,
            default_retry: RetryPolicy::none(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Control-plane view of one execution.
#[derive(Clone, Debug)]
pub struct ExecutionDescription {
    pub execution_id: String,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub cursor: String,
    pub completed: Vec<CompletedNode>,
    pub failed: Vec<FailedNode>,
    pub outputs: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Infrastructure-level scheduler failures. Task-level failures do not
/// surface here: a run that ends in `failed` still returns the execution
/// record, whose `failed` list carries the node failures.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("flow not found: {flow_id}")]
    #[diagnostic(code(rillflow::scheduler::flow_not_found))]
    FlowNotFound { flow_id: String },

    #[error("execution not found: {execution_id}")]
    #[diagnostic(code(rillflow::scheduler::execution_not_found))]
    ExecutionNotFound { execution_id: String },

    #[error("input rejected: {fault}")]
    #[diagnostic(code(rillflow::scheduler::invalid_input))]
    InvalidInput {
        #[source]
        fault: ValidationFault,
    },

    #[error("flow {flow_id} definition changed since this execution started")]
    #[diagnostic(
        code(rillflow::scheduler::definition_drift),
        help("In-flight executions are bound to the flow definition hash stored in their snapshots; finish or delete them before re-registering a changed flow.")
    )]
    DefinitionDrift { flow_id: String },

    #[error("execution {execution_id} is not running in this scheduler")]
    #[diagnostic(code(rillflow::scheduler::not_running))]
    NotRunning { execution_id: String },

    #[error(transparent)]
    #[diagnostic(code(rillflow::scheduler::storage))]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(code(rillflow::scheduler::persistence))]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    #[diagnostic(code(rillflow::scheduler::registry))]
    Registry(#[from] RegistryError),
}

/// Why an advance loop stopped before finishing its plan.
enum Halt {
    /// Cooperative pause; the caller persists the `Paused` transition.
    Paused,
    /// A node failed terminally; the caller unwinds through compensation.
    Failure(NodeFailure),
    /// Infrastructure failure; the scheduler releases the execution.
    Fatal(SchedulerError),
}

impl From<SchedulerError> for Halt {
    fn from(e: SchedulerError) -> Self {
        Halt::Fatal(e)
    }
}

impl From<StorageError> for Halt {
    fn from(e: StorageError) -> Self {
        Halt::Fatal(e.into())
    }
}

impl From<PersistenceError> for Halt {
    fn from(e: PersistenceError) -> Self {
        Halt::Fatal(e.into())
    }
}

/// Serialized event-log writer shared by the driver and in-flight arms.
pub(crate) struct EventAppender {
    storage: Arc<dyn Storage>,
    execution_id: String,
    emitter: EventEmitter,
    seq: tokio::sync::Mutex<u64>,
}

impl EventAppender {
    fn new(
        storage: Arc<dyn Storage>,
        execution_id: String,
        next_seq: u64,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            storage,
            execution_id,
            emitter,
            seq: tokio::sync::Mutex::new(next_seq),
        }
    }

    async fn append(&self, event: ExecutionEvent) -> Result<EventRecord, StorageError> {
        let mut seq = self.seq.lock().await;
        let record = EventRecord {
            execution_id: self.execution_id.clone(),
            seq: *seq,
            at: Utc::now(),
            event,
        };
        self.storage.append_event(record.clone()).await?;
        *seq += 1;
        self.emitter.emit(record.clone());
        Ok(record)
    }
}

/// Node-id rewriting for runtime instances of loop/for-each bodies, so
/// events and task results from different iterations or elements do not
/// collide. Substitutions apply outermost-first.
#[derive(Clone, Debug, Default)]
struct Relabel {
    subs: Vec<(String, String)>,
}

impl Relabel {
    fn identity() -> Self {
        Self::default()
    }

    fn single(from: String, to: String) -> Self {
        Self {
            subs: vec![(from, to)],
        }
    }

    fn extended(&self, from: String, to: String) -> Self {
        let mut subs = self.subs.clone();
        subs.push((from, to));
        Self { subs }
    }

    fn apply(&self, id: &str) -> String {
        let mut current = id.to_string();
        for (from, to) in &self.subs {
            if current == *from {
                current = to.clone();
            } else if current.starts_with(from) && current[from.len()..].starts_with('.') {
                current = format!("{to}{}", &current[from.len()..]);
            }
        }
        current
    }
}

struct AttemptSuccess {
    value: Value,
    vars: BTreeMap<String, Value>,
    attempt: u32,
}

/// Everything a transient (in-arm) executor needs; deliberately free of
/// borrows into the driver so arms can run while the driver persists
/// settled siblings.
#[derive(Clone)]
struct TransientCtx<'s> {
    sched: &'s Scheduler,
    appender: Arc<EventAppender>,
    flow_id: String,
    execution_id: String,
    cancel: CancelSignal,
    outputs: Arc<BTreeMap<String, Value>>,
    base_vars: BTreeMap<String, Value>,
}

/// The execution engine.
///
/// Owns the flow registry handle, the storage port, the schema validator,
/// the process-wide circuit breakers, and the event bus. All control-plane
/// operations of the engine live here: registration, start, pause, resume,
/// describe, list, delete.
pub struct Scheduler {
    registry: Arc<FlowRegistry>,
    storage: Arc<dyn Storage>,
    validator: Arc<dyn PayloadValidator>,
    breakers: CircuitBreakerRegistry,
    bus: EventBus,
    permits: Arc<Semaphore>,
    running: Mutex<FxHashMap<String, Arc<CancelHandle>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(registry: Arc<FlowRegistry>, storage: Arc<dyn Storage>) -> Self {
        Self::with_config(registry, storage, SchedulerConfig::default())
    }

    #[must_use]
    pub fn with_config(
        registry: Arc<FlowRegistry>,
        storage: Arc<dyn Storage>,
        config: SchedulerConfig,
    ) -> Self {
        let bus = EventBus::default();
        bus.listen();
        Self {
            registry,
            storage,
            validator: Arc::new(ShapeValidator),
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            bus,
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            running: Mutex::new(FxHashMap::default()),
            config,
        }
    }

    /// Substitute the schema validator (e.g. a host-provided one).
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Substitute the event bus (e.g. with custom sinks).
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        bus.listen();
        self.bus = bus;
        self
    }

    pub fn register_flow(&self, flow: Flow) -> Result<Arc<Flow>, SchedulerError> {
        Ok(self.registry.register(flow)?)
    }

    #[must_use]
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    #[must_use]
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Create an execution record for `flow_id` with the given input,
    /// persist snapshot version 0, and return the fresh execution id.
    /// The execution does not advance until [`run_to_completion`] is
    /// called for it.
    ///
    /// [`run_to_completion`]: Self::run_to_completion
    #[instrument(skip(self, input, metadata), err)]
    pub async fn start_execution(
        &self,
        flow_id: &str,
        input: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Result<String, SchedulerError> {
        let flow = self
            .registry
            .get(flow_id)
            .ok_or_else(|| SchedulerError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })?;
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.create_execution(&flow, input, metadata, &execution_id)
            .await?;
        Ok(execution_id)
    }

    async fn create_execution(
        &self,
        flow: &Arc<Flow>,
        input: Value,
        metadata: BTreeMap<String, Value>,
        execution_id: &str,
    ) -> Result<Execution, SchedulerError> {
        let input = self
            .validator
            .validate(flow.input_schema(), &input)
            .map_err(|fault| SchedulerError::InvalidInput { fault })?;
        let mut metadata = metadata;
        for (key, value) in flow.metadata() {
            metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let appender = EventAppender::new(
            self.storage.clone(),
            execution_id.to_string(),
            0,
            self.bus.emitter(),
        );
        let mut exec = Execution::empty(execution_id);
        let record = appender
            .append(ExecutionEvent::ExecutionStarted {
                flow_id: flow.id().to_string(),
                definition_hash: flow.definition_hash().to_string(),
                input,
                metadata,
            })
            .await?;
        exec.apply(&record, |_, _| None);
        let blob = persistence::to_blob(&exec)?;
        self.storage.put_snapshot(execution_id, 0, blob).await?;
        Ok(exec)
    }

    async fn hydrate(
        &self,
        execution_id: &str,
    ) -> Result<(Arc<Flow>, Execution, u64, u64), SchedulerError> {
        let (version, blob) = self
            .storage
            .latest_snapshot(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let exec = persistence::from_blob(&blob)?;
        let flow = self
            .registry
            .get(&exec.flow_id)
            .ok_or_else(|| SchedulerError::FlowNotFound {
                flow_id: exec.flow_id.clone(),
            })?;
        if flow.definition_hash() != exec.definition_hash {
            return Err(SchedulerError::DefinitionDrift {
                flow_id: exec.flow_id.clone(),
            });
        }
        let seq = self.storage.read_events(execution_id, 0).await?.len() as u64;
        Ok((flow, exec, version + 1, seq))
    }

    /// Drive an execution until it completes, fails, or pauses. Acquires
    /// a worker-pool permit and the storage lease for the duration.
    ///
    /// Returns the final execution record; inspect its `status` to learn
    /// the outcome. `Err` is reserved for infrastructure failures
    /// (storage, lease, registry drift).
    #[instrument(skip(self), err)]
    pub async fn run_to_completion(
        &self,
        execution_id: &str,
    ) -> Result<Execution, SchedulerError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Backend {
                message: "worker pool closed".to_string(),
            })?;

        let (flow, exec, next_version, seq) = self.hydrate(execution_id).await?;
        if exec.status.is_terminal() {
            return Ok(exec);
        }
        let lease = self
            .storage
            .acquire_lease(execution_id, &self.config.owner, self.config.lease_ttl)
            .await?;

        let handle = Arc::new(CancelHandle::new());
        self.running
            .lock()
            .expect("running map poisoned")
            .insert(execution_id.to_string(), handle.clone());

        let appender = Arc::new(EventAppender::new(
            self.storage.clone(),
            execution_id.to_string(),
            seq,
            self.bus.emitter(),
        ));
        let driver = Driver {
            sched: self,
            flow,
            exec,
            appender,
            lease: lease.clone(),
            next_version,
            cancel: handle.signal(),
        };
        let result = driver.drive().await;

        self.running
            .lock()
            .expect("running map poisoned")
            .remove(execution_id);
        if let Err(e) = self.storage.release_lease(lease).await {
            tracing::debug!(execution_id, error = %e, "lease release after run failed");
        }
        result
    }

    /// Start and drive in one call.
    pub async fn run_flow(
        &self,
        flow_id: &str,
        input: Value,
    ) -> Result<Execution, SchedulerError> {
        let execution_id = self
            .start_execution(flow_id, input, BTreeMap::new())
            .await?;
        self.run_to_completion(&execution_id).await
    }

    /// Request a cooperative pause of an execution this scheduler is
    /// currently driving. Running attempts observe the cancel signal at
    /// their next suspension point; the driver persists the `paused`
    /// snapshot once everything in flight has settled.
    pub fn pause(&self, execution_id: &str) -> Result<(), SchedulerError> {
        let running = self.running.lock().expect("running map poisoned");
        match running.get(execution_id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(SchedulerError::NotRunning {
                execution_id: execution_id.to_string(),
            }),
        }
    }

    /// Resume a paused (or interrupted) execution from its latest
    /// snapshot. Nodes recorded as completed are skipped; anything that
    /// was in flight is treated as ready and re-executed.
    pub async fn resume(&self, execution_id: &str) -> Result<Execution, SchedulerError> {
        self.run_to_completion(execution_id).await
    }

    pub async fn describe_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionDescription, SchedulerError> {
        let (_, blob) = self
            .storage
            .latest_snapshot(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let exec = persistence::from_blob(&blob)?;
        Ok(ExecutionDescription {
            execution_id: exec.execution_id,
            flow_id: exec.flow_id,
            status: exec.status,
            cursor: exec.cursor,
            completed: exec.completed,
            failed: exec.failed,
            outputs: exec.outputs,
            metadata: exec.metadata,
            created_at: exec.created_at,
            updated_at: exec.updated_at,
        })
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: &Page,
    ) -> Result<ExecutionPage, SchedulerError> {
        Ok(self.storage.list_executions(filter, page).await?)
    }

    pub async fn delete_execution(&self, execution_id: &str) -> Result<(), SchedulerError> {
        Ok(self.storage.delete_execution(execution_id).await?)
    }

    /// Drive a nested child execution synchronously within a parent.
    /// The child id is derived from the parent execution and node, so a
    /// resumed parent re-attaches to the same child.
    fn run_child<'a>(
        &'a self,
        flow: Arc<Flow>,
        input: Value,
        child_id: String,
        parent_id: String,
        cancel: CancelSignal,
    ) -> BoxFuture<'a, Result<Execution, SchedulerError>> {
        Box::pin(async move {
            let (exec, next_version, seq) = match self.storage.latest_snapshot(&child_id).await? {
                Some((version, blob)) => {
                    let exec = persistence::from_blob(&blob)?;
                    if exec.definition_hash != flow.definition_hash() {
                        return Err(SchedulerError::DefinitionDrift {
                            flow_id: flow.id().to_string(),
                        });
                    }
                    let seq = self.storage.read_events(&child_id, 0).await?.len() as u64;
                    (exec, version + 1, seq)
                }
                None => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("parent_execution_id".to_string(), json!(parent_id));
                    let exec = self
                        .create_execution(&flow, input, metadata, &child_id)
                        .await?;
                    (exec, 1, 1)
                }
            };
            if exec.status.is_terminal() {
                return Ok(exec);
            }
            let lease = self
                .storage
                .acquire_lease(&child_id, &self.config.owner, self.config.lease_ttl)
                .await?;
            let appender = Arc::new(EventAppender::new(
                self.storage.clone(),
                child_id.clone(),
                seq,
                self.bus.emitter(),
            ));
            let driver = Driver {
                sched: self,
                flow,
                exec,
                appender,
                lease: lease.clone(),
                next_version,
                cancel,
            };
            let result = driver.drive().await;
            if let Err(e) = self.storage.release_lease(lease).await {
                tracing::debug!(child_id, error = %e, "child lease release failed");
            }
            result
        })
    }
}

/// Single-owner advance loop for one execution.
struct Driver<'s> {
    sched: &'s Scheduler,
    flow: Arc<Flow>,
    exec: Execution,
    appender: Arc<EventAppender>,
    lease: Lease,
    next_version: u64,
    cancel: CancelSignal,
}

impl<'s> Driver<'s> {
    async fn drive(mut self) -> Result<Execution, SchedulerError> {
        if self.exec.status.is_terminal() {
            return Ok(self.exec);
        }
        if self.exec.status != ExecutionStatus::Pending {
            self.emit_apply(ExecutionEvent::Resumed {
                owner: self.sched.config.owner.clone(),
            })
            .await?;
        }

        // A crash or pause mid-compensation resumes the unwind, not the plan.
        if let Some(last_failed) = self.exec.failed.last().cloned() {
            let failure = NodeFailure::new(
                last_failed.error_kind,
                last_failed.node_id,
                1,
                last_failed.detail,
            );
            return self.unwind(failure).await;
        }

        let flow = self.flow.clone();
        let input = self.exec.input.clone();
        let outcome = self.run_plan(flow.plan(), input).await;
        match outcome {
            Ok(_final_value) => {
                let final_ref = flow
                    .plan()
                    .nodes()
                    .last()
                    .map(|n| n.id.clone())
                    .unwrap_or_default();
                self.emit_apply(ExecutionEvent::ExecutionCompleted {
                    final_output_ref: final_ref,
                })
                .await?;
                Ok(self.exec)
            }
            Err(Halt::Paused) => {
                self.emit_apply(ExecutionEvent::Paused {
                    reason: "pause requested".to_string(),
                })
                .await?;
                Ok(self.exec)
            }
            Err(Halt::Failure(failure)) => self.unwind(failure).await,
            Err(Halt::Fatal(e)) => Err(e),
        }
    }

    /// Compensate completed nodes in reverse order, then mark the
    /// execution failed. Compensation failures are recorded but never
    /// trigger further compensation.
    async fn unwind(mut self, failure: NodeFailure) -> Result<Execution, SchedulerError> {
        let flow = self.flow.clone();
        let targets: Vec<(String, String, Arc<dyn Task>)> = self
            .exec
            .completed
            .iter()
            .rev()
            .filter(|c| {
                !self.exec.compensated.contains(&c.node_id)
                    && !self
                        .exec
                        .compensation_errors
                        .iter()
                        .any(|e| e.node_id == c.node_id)
            })
            .filter_map(|c| match &flow.plan().node_by_id(&c.node_id)?.body {
                NodeBody::Step(task) if task.has_compensation() => {
                    Some((c.node_id.clone(), c.output_ref.clone(), task.clone()))
                }
                _ => None,
            })
            .collect();

        if !targets.is_empty() {
            self.emit_apply(ExecutionEvent::CompensationStarted).await?;
        }
        for (node_id, output_ref, task) in targets {
            let output = self
                .exec
                .outputs
                .get(&output_ref)
                .cloned()
                .unwrap_or(Value::Null);
            let ctx = TaskContext::new(
                self.flow.id().to_string(),
                self.exec.execution_id.clone(),
                node_id.clone(),
                1,
                Arc::new(self.exec.outputs.clone()),
                Arc::new(VariableScope::new(self.exec.variables.clone())),
                self.cancel.clone(),
            );
            match task.compensate(output, &ctx).await {
                Ok(()) => {
                    self.emit_apply(ExecutionEvent::Compensated { node_id }).await?;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "compensation failed");
                    self.emit_apply(ExecutionEvent::CompensationFailed {
                        node_id,
                        detail: e.to_string(),
                    })
                    .await?;
                }
            }
        }
        self.emit_apply(ExecutionEvent::ExecutionFailed {
            error_kind: failure.kind,
        })
        .await?;
        Ok(self.exec)
    }

    /// Append an event, apply it to the record, and snapshot when due.
    async fn emit_apply(&mut self, event: ExecutionEvent) -> Result<(), SchedulerError> {
        let record = self.appender.append(event).await?;
        if self.exec.apply(&record, |_, _| None) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn persist(&mut self) -> Result<(), SchedulerError> {
        let blob = persistence::to_blob(&self.exec)?;
        self.sched
            .storage
            .put_snapshot(&self.exec.execution_id, self.next_version, blob)
            .await?;
        self.next_version += 1;
        self.lease = self.sched.storage.renew_lease(&self.lease).await?;
        Ok(())
    }

    /// Persist a settled output: task result row, `NodeSucceeded` event,
    /// record transition, snapshot.
    async fn record_progress(
        &mut self,
        label: &str,
        output_ref: &str,
        attempt: u32,
        value: Value,
        vars: BTreeMap<String, Value>,
    ) -> Result<(), Halt> {
        self.sched
            .storage
            .put_task_result(
                &self.exec.execution_id,
                TaskResultRecord {
                    node_id: label.to_string(),
                    attempt,
                    status: AttemptStatus::Succeeded,
                    output: Some(value.clone()),
                    variables: vars.clone(),
                    error_kind: None,
                    error_detail: None,
                    at: Utc::now(),
                },
            )
            .await
            .map_err(SchedulerError::from)?;
        let record = self
            .appender
            .append(ExecutionEvent::NodeSucceeded {
                node_id: label.to_string(),
                attempt,
                output_ref: Some(output_ref.to_string()),
            })
            .await
            .map_err(SchedulerError::from)?;
        let payload = Some((value, vars));
        if self.exec.apply(&record, |_, _| payload.clone()) {
            self.persist().await?;
        }
        Ok(())
    }

    /// Mark a node terminally failed and return the failure for unwinding.
    async fn fail_node(&mut self, failure: NodeFailure) -> Result<NodeFailure, Halt> {
        let record = self
            .appender
            .append(ExecutionEvent::NodeFailed {
                node_id: failure.node_id.clone(),
                attempt: failure.attempt,
                error_kind: failure.kind,
                detail: failure.message.clone(),
            })
            .await
            .map_err(SchedulerError::from)?;
        if self.exec.apply(&record, |_, _| None) {
            self.persist().await?;
        }
        Ok(failure)
    }

    /// Convert an arm/iteration halt into a failure of the composite node.
    async fn compose_failure(&mut self, node: &Node, halt: Halt) -> Halt {
        match halt {
            Halt::Failure(inner) => {
                let failure = NodeFailure {
                    kind: inner.kind,
                    message: if inner.node_id == node.id {
                        inner.message
                    } else {
                        format!("{} (at {})", inner.message, inner.node_id)
                    },
                    node_id: node.id.clone(),
                    attempt: inner.attempt,
                    detail: inner.detail,
                };
                match self.fail_node(failure).await {
                    Ok(f) => Halt::Failure(f),
                    Err(halt) => halt,
                }
            }
            other => other,
        }
    }

    fn transient_ctx(&self) -> TransientCtx<'s> {
        TransientCtx {
            sched: self.sched,
            appender: self.appender.clone(),
            flow_id: self.flow.id().to_string(),
            execution_id: self.exec.execution_id.clone(),
            cancel: self.cancel.clone(),
            outputs: Arc::new(self.exec.outputs.clone()),
            base_vars: self.exec.variables.clone(),
        }
    }

    /// Run a (sub-)sequence with durable per-node persistence, skipping
    /// nodes the snapshot already records as completed.
    fn run_plan<'a>(
        &'a mut self,
        plan: &'a Plan,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, Halt>> {
        Box::pin(async move {
            let mut current = input;
            for node in plan.nodes() {
                if self.exec.is_node_completed(&node.id) {
                    if let Some(output) = self.exec.outputs.get(&node.id) {
                        current = output.clone();
                    }
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return Err(Halt::Paused);
                }
                current = self.run_node(node, current).await?;
            }
            Ok(current)
        })
    }

    fn run_node<'a>(
        &'a mut self,
        node: &'a Node,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, Halt>> {
        Box::pin(async move {
            match &node.body {
                NodeBody::Step(task) => self.run_step(node, task, input).await,
                NodeBody::Branch(arms) => {
                    let chosen = arms.iter().position(|arm| (arm.predicate)(&input));
                    let Some(index) = chosen else {
                        let failure = self
                            .fail_node(NodeFailure::new(
                                ErrorKind::TaskError,
                                node.id.as_str(),
                                1,
                                "no matching branch arm",
                            ))
                            .await?;
                        return Err(Halt::Failure(failure));
                    };
                    let output = self.run_plan(&arms[index].body, input).await?;
                    self.record_progress(&node.id, &node.id, 1, output.clone(), BTreeMap::new())
                        .await?;
                    Ok(output)
                }
                NodeBody::Parallel(arm_plans) => self.run_parallel(node, arm_plans, input).await,
                NodeBody::While {
                    predicate,
                    body,
                    max_iterations,
                } => {
                    self.run_while(node, predicate.clone(), body, *max_iterations, input)
                        .await
                }
                NodeBody::ForEach { body, concurrency } => {
                    self.run_for_each(node, body, *concurrency, input).await
                }
                NodeBody::Nested(child_flow) => self.run_nested(node, child_flow, input).await,
            }
        })
    }

    async fn run_step(
        &mut self,
        node: &Node,
        task: &Arc<dyn Task>,
        input: Value,
    ) -> Result<Value, Halt> {
        let outputs = Arc::new(self.exec.outputs.clone());
        let base_vars = self.exec.variables.clone();
        let flow_id = self.flow.id().to_string();
        let execution_id = self.exec.execution_id.clone();
        let result = attempt_task(
            self.sched,
            &self.appender,
            &flow_id,
            &execution_id,
            &node.id,
            task,
            input,
            outputs,
            base_vars,
            &self.cancel,
        )
        .await;
        match result {
            Ok(success) => {
                self.record_progress(
                    &node.id,
                    &node.id,
                    success.attempt,
                    success.value.clone(),
                    success.vars,
                )
                .await?;
                Ok(success.value)
            }
            Err(Halt::Failure(failure)) => {
                let failure = self.fail_node(failure).await?;
                Err(Halt::Failure(failure))
            }
            Err(other) => Err(other),
        }
    }

    async fn run_while(
        &mut self,
        node: &Node,
        predicate: crate::plan::Predicate,
        body: &Plan,
        max_iterations: u32,
        input: Value,
    ) -> Result<Value, Halt> {
        let iter_ref = format!("{}.iter", node.id);
        let (mut value, mut iteration) = match self.exec.loops.get(&node.id) {
            Some(n) => (
                self.exec
                    .outputs
                    .get(&iter_ref)
                    .cloned()
                    .unwrap_or(input),
                *n,
            ),
            None => (input, 0),
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(Halt::Paused);
            }
            if !(predicate)(&value) {
                break;
            }
            if iteration >= max_iterations {
                tracing::warn!(
                    node_id = %node.id,
                    max_iterations,
                    "loop reached its iteration cap"
                );
                break;
            }
            iteration += 1;
            let label = format!("{}.iter.{}", node.id, iteration);
            let relabel = Relabel::single(format!("{}.loop.0", node.id), label.clone());
            let outcome = {
                let ctx = self.transient_ctx();
                run_transient_plan(&ctx, body, value.clone(), BTreeMap::new(), &relabel).await
            };
            match outcome {
                Ok((output, vars)) => {
                    self.record_progress(&label, &iter_ref, 1, output.clone(), vars)
                        .await?;
                    value = output;
                }
                Err(halt) => return Err(self.compose_failure(node, halt).await),
            }
        }

        self.record_progress(&node.id, &node.id, 1, value.clone(), BTreeMap::new())
            .await?;
        Ok(value)
    }

    async fn run_for_each(
        &mut self,
        node: &Node,
        body: &Plan,
        concurrency: usize,
        input: Value,
    ) -> Result<Value, Halt> {
        let Some(items) = input.as_array().cloned() else {
            let failure = self
                .fail_node(NodeFailure::new(
                    ErrorKind::ValidationError,
                    node.id.as_str(),
                    1,
                    "for_each input is not a sequence",
                ))
                .await?;
            return Err(Halt::Failure(failure));
        };
        let item_key = |i: usize| format!("{}.item.{}", node.id, i);
        let pending: Vec<usize> = (0..items.len())
            .filter(|i| !self.exec.outputs.contains_key(&item_key(*i)))
            .collect();

        if !pending.is_empty() {
            let ctx = self.transient_ctx();
            let make = |i: usize| {
                let relabel = Relabel::single(
                    format!("{}.each.0", node.id),
                    format!("{}.item.{}", node.id, i),
                );
                let value = items[i].clone();
                let ctx = &ctx;
                async move {
                    (
                        i,
                        run_transient_plan(ctx, body, value, BTreeMap::new(), &relabel).await,
                    )
                }
            };

            let mut queue = pending.into_iter();
            let mut in_flight = FuturesUnordered::new();
            for _ in 0..concurrency.max(1) {
                if let Some(i) = queue.next() {
                    in_flight.push(make(i));
                }
            }
            let mut written: BTreeMap<String, usize> = BTreeMap::new();
            while let Some((i, outcome)) = in_flight.next().await {
                match outcome {
                    Ok((output, vars)) => {
                        if concurrency > 1 {
                            if let Some(conflict) =
                                vars.keys().find(|k| written.get(*k).is_some_and(|o| *o != i))
                            {
                                drop(in_flight);
                                let failure = self
                                    .fail_node(NodeFailure::new(
                                        ErrorKind::ConcurrentVariableConflict,
                                        node.id.as_str(),
                                        1,
                                        format!(
                                            "variable {conflict} written by concurrent elements"
                                        ),
                                    ))
                                    .await?;
                                return Err(Halt::Failure(failure));
                            }
                            for key in vars.keys() {
                                written.insert(key.clone(), i);
                            }
                        }
                        let key = item_key(i);
                        self.record_progress(&key, &key, 1, output, vars).await?;
                        if let Some(next) = queue.next() {
                            in_flight.push(make(next));
                        }
                    }
                    Err(halt) => {
                        drop(in_flight);
                        return Err(self.compose_failure(node, halt).await);
                    }
                }
            }
        }

        let assembled = Value::Array(
            (0..items.len())
                .map(|i| {
                    self.exec
                        .outputs
                        .get(&item_key(i))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect(),
        );
        self.record_progress(&node.id, &node.id, 1, assembled.clone(), BTreeMap::new())
            .await?;
        Ok(assembled)
    }

    async fn run_parallel(
        &mut self,
        node: &Node,
        arm_plans: &[Plan],
        input: Value,
    ) -> Result<Value, Halt> {
        let arm_key = |k: usize| format!("{}.arm.{}", node.id, k);

        // Seed conflict detection with variable keys written by arms that
        // settled before a pause.
        let mut written: BTreeMap<String, usize> = BTreeMap::new();
        for k in 0..arm_plans.len() {
            if self.exec.outputs.contains_key(&arm_key(k)) {
                if let Some(result) = self
                    .sched
                    .storage
                    .task_result(&self.exec.execution_id, &arm_key(k), 1)
                    .await
                    .map_err(SchedulerError::from)?
                {
                    for key in result.variables.keys() {
                        written.insert(key.clone(), k);
                    }
                }
            }
        }

        let pending: Vec<usize> = (0..arm_plans.len())
            .filter(|k| !self.exec.outputs.contains_key(&arm_key(*k)))
            .collect();

        if !pending.is_empty() {
            let ctx = self.transient_ctx();
            let mut in_flight: FuturesUnordered<_> = pending
                .into_iter()
                .map(|k| {
                    let arm = &arm_plans[k];
                    let value = input.clone();
                    let ctx = &ctx;
                    async move {
                        (
                            k,
                            run_transient_plan(
                                ctx,
                                arm,
                                value,
                                BTreeMap::new(),
                                &Relabel::identity(),
                            )
                            .await,
                        )
                    }
                })
                .collect();

            while let Some((k, outcome)) = in_flight.next().await {
                match outcome {
                    Ok((output, vars)) => {
                        if let Some(conflict) =
                            vars.keys().find(|key| written.get(*key).is_some_and(|o| *o != k))
                        {
                            drop(in_flight);
                            let failure = self
                                .fail_node(NodeFailure::new(
                                    ErrorKind::ConcurrentVariableConflict,
                                    node.id.as_str(),
                                    1,
                                    format!("variable {conflict} written by concurrent arms"),
                                ))
                                .await?;
                            return Err(Halt::Failure(failure));
                        }
                        for key in vars.keys() {
                            written.insert(key.clone(), k);
                        }
                        let key = arm_key(k);
                        self.record_progress(&key, &key, 1, output, vars).await?;
                    }
                    Err(halt) => {
                        drop(in_flight);
                        return Err(self.compose_failure(node, halt).await);
                    }
                }
            }
        }

        // Arm outputs reassemble in declared order regardless of
        // completion order.
        let assembled = Value::Array(
            (0..arm_plans.len())
                .map(|k| {
                    self.exec
                        .outputs
                        .get(&arm_key(k))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect(),
        );
        self.record_progress(&node.id, &node.id, 1, assembled.clone(), BTreeMap::new())
            .await?;
        Ok(assembled)
    }

    async fn run_nested(
        &mut self,
        node: &Node,
        child_flow: &Arc<Flow>,
        input: Value,
    ) -> Result<Value, Halt> {
        let child_id = format!("{}/{}", self.exec.execution_id, node.id);
        let child = self
            .sched
            .run_child(
                child_flow.clone(),
                input,
                child_id,
                self.exec.execution_id.clone(),
                self.cancel.clone(),
            )
            .await
            .map_err(Halt::Fatal)?;
        match child.status {
            ExecutionStatus::Completed => {
                let output = child.final_output().cloned().unwrap_or(Value::Null);
                self.record_progress(&node.id, &node.id, 1, output.clone(), BTreeMap::new())
                    .await?;
                Ok(output)
            }
            ExecutionStatus::Paused => Err(Halt::Paused),
            _ => {
                let kind = child
                    .failed
                    .last()
                    .map(|f| f.error_kind)
                    .unwrap_or(ErrorKind::TaskError);
                let failure = self
                    .fail_node(
                        NodeFailure::new(
                            kind,
                            node.id.as_str(),
                            1,
                            format!("nested flow {} failed", child_flow.id()),
                        )
                        .with_detail(json!({ "child_execution_id": child.execution_id })),
                    )
                    .await?;
                Err(Halt::Failure(failure))
            }
        }
    }
}

/// Execute one task with retry, circuit breaking, timeout, and
/// cancellation. Emits `NodeStarted`/`RetryScheduled` audit events and a
/// task-result row per attempt; terminal events are the caller's job.
#[allow(clippy::too_many_arguments)]
async fn attempt_task(
    sched: &Scheduler,
    appender: &EventAppender,
    flow_id: &str,
    execution_id: &str,
    label: &str,
    task: &Arc<dyn Task>,
    input: Value,
    outputs: Arc<BTreeMap<String, Value>>,
    base_vars: BTreeMap<String, Value>,
    cancel: &CancelSignal,
) -> Result<AttemptSuccess, Halt> {
    enum AttemptOutcome {
        Done(Result<Value, crate::task::TaskError>),
        TimedOut,
        Cancelled,
    }

    let policy = task
        .retry_policy()
        .unwrap_or_else(|| sched.config.default_retry.clone());
    let mut attempt: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Halt::Paused);
        }

        if !sched.breakers.try_acquire(task.id()) {
            let message = format!("circuit open for task {}", task.id());
            store_failure(
                sched,
                execution_id,
                label,
                attempt,
                ErrorKind::CircuitOpen,
                &message,
            )
            .await?;
            return Err(Halt::Failure(NodeFailure::new(
                ErrorKind::CircuitOpen,
                label,
                attempt,
                message,
            )));
        }

        let input_valid = match sched.validator.validate(&task.input_schema(), &input) {
            Ok(v) => v,
            Err(fault) => {
                let message = fault.to_string();
                store_failure(
                    sched,
                    execution_id,
                    label,
                    attempt,
                    ErrorKind::ValidationError,
                    &message,
                )
                .await?;
                return Err(Halt::Failure(
                    NodeFailure::new(ErrorKind::ValidationError, label, attempt, message)
                        .with_detail(serde_json::to_value(&fault).unwrap_or(Value::Null)),
                ));
            }
        };

        appender
            .append(ExecutionEvent::NodeStarted {
                node_id: label.to_string(),
                attempt,
            })
            .await
            .map_err(Halt::from)?;

        let scope = Arc::new(VariableScope::new(base_vars.clone()));
        let ctx = TaskContext::new(
            flow_id.to_string(),
            execution_id.to_string(),
            label.to_string(),
            attempt,
            outputs.clone(),
            scope.clone(),
            cancel.clone(),
        );

        let outcome = {
            let run = task.execute(input_valid, &ctx);
            match task.timeout() {
                Some(deadline) => tokio::select! {
                    _ = cancel.cancelled() => AttemptOutcome::Cancelled,
                    result = tokio::time::timeout(deadline, run) => match result {
                        Ok(inner) => AttemptOutcome::Done(inner),
                        Err(_) => AttemptOutcome::TimedOut,
                    },
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => AttemptOutcome::Cancelled,
                    inner = run => AttemptOutcome::Done(inner),
                },
            }
        };

        let (kind, message, detail) = match outcome {
            AttemptOutcome::Cancelled => {
                // Cancelled attempts settle without consuming retry budget.
                sched
                    .storage
                    .put_task_result(
                        execution_id,
                        TaskResultRecord {
                            node_id: label.to_string(),
                            attempt,
                            status: AttemptStatus::Cancelled,
                            output: None,
                            variables: BTreeMap::new(),
                            error_kind: Some(ErrorKind::Cancelled),
                            error_detail: None,
                            at: Utc::now(),
                        },
                    )
                    .await
                    .map_err(SchedulerError::from)?;
                return Err(Halt::Paused);
            }
            AttemptOutcome::Done(Ok(raw_output)) => {
                match sched.validator.validate(&task.output_schema(), &raw_output) {
                    Ok(output) => {
                        let vars = scope.take_writes();
                        sched.breakers.record_success(task.id());
                        sched
                            .storage
                            .put_task_result(
                                execution_id,
                                TaskResultRecord {
                                    node_id: label.to_string(),
                                    attempt,
                                    status: AttemptStatus::Succeeded,
                                    output: Some(output.clone()),
                                    variables: vars.clone(),
                                    error_kind: None,
                                    error_detail: None,
                                    at: Utc::now(),
                                },
                            )
                            .await
                            .map_err(SchedulerError::from)?;
                        return Ok(AttemptSuccess {
                            value: output,
                            vars,
                            attempt,
                        });
                    }
                    Err(fault) => (
                        ErrorKind::ValidationError,
                        format!("output rejected: {fault}"),
                        serde_json::to_value(&fault).unwrap_or(Value::Null),
                    ),
                }
            }
            AttemptOutcome::Done(Err(task_error)) => (
                ErrorKind::TaskError,
                task_error.to_string(),
                task_error.detail(),
            ),
            AttemptOutcome::TimedOut => (
                ErrorKind::Timeout,
                "attempt deadline exceeded".to_string(),
                Value::Null,
            ),
        };

        sched.breakers.record_failure(task.id());
        store_failure(sched, execution_id, label, attempt, kind, &message).await?;

        if policy.should_retry(kind, attempt) {
            let delay = policy.sleep_after(attempt);
            appender
                .append(ExecutionEvent::RetryScheduled {
                    node_id: label.to_string(),
                    next_attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                })
                .await
                .map_err(Halt::from)?;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Halt::Paused),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            continue;
        }

        return Err(Halt::Failure(
            NodeFailure::new(kind, label, attempt, message).with_detail(detail),
        ));
    }
}

async fn store_failure(
    sched: &Scheduler,
    execution_id: &str,
    label: &str,
    attempt: u32,
    kind: ErrorKind,
    message: &str,
) -> Result<(), Halt> {
    sched
        .storage
        .put_task_result(
            execution_id,
            TaskResultRecord {
                node_id: label.to_string(),
                attempt,
                status: AttemptStatus::Failed,
                output: None,
                variables: BTreeMap::new(),
                error_kind: Some(kind),
                error_detail: Some(message.to_string()),
                at: Utc::now(),
            },
        )
        .await
        .map_err(SchedulerError::from)?;
    Ok(())
}

/// Run a sub-plan without touching the execution record: attempts emit
/// audit events and task results under relabelled instance ids, and the
/// accumulated output/variable delta is returned for the caller to
/// persist at the composite-node boundary.
fn run_transient_plan<'a>(
    ctx: &'a TransientCtx<'a>,
    plan: &'a Plan,
    input: Value,
    delta: BTreeMap<String, Value>,
    relabel: &'a Relabel,
) -> BoxFuture<'a, Result<(Value, BTreeMap<String, Value>), Halt>> {
    Box::pin(async move {
        let mut current = input;
        let mut delta = delta;
        for node in plan.nodes() {
            if ctx.cancel.is_cancelled() {
                return Err(Halt::Paused);
            }
            let (value, next_delta) =
                run_transient_node(ctx, node, current, delta, relabel).await?;
            current = value;
            delta = next_delta;
        }
        Ok((current, delta))
    })
}

async fn run_transient_node<'a>(
    ctx: &'a TransientCtx<'a>,
    node: &'a Node,
    input: Value,
    mut delta: BTreeMap<String, Value>,
    relabel: &'a Relabel,
) -> Result<(Value, BTreeMap<String, Value>), Halt> {
    let label = relabel.apply(&node.id);
    match &node.body {
        NodeBody::Step(task) => {
            let mut base = ctx.base_vars.clone();
            base.extend(delta.clone());
            let success = attempt_task(
                ctx.sched,
                &ctx.appender,
                &ctx.flow_id,
                &ctx.execution_id,
                &label,
                task,
                input,
                ctx.outputs.clone(),
                base,
                &ctx.cancel,
            )
            .await?;
            ctx.appender
                .append(ExecutionEvent::NodeSucceeded {
                    node_id: label,
                    attempt: success.attempt,
                    output_ref: None,
                })
                .await
                .map_err(Halt::from)?;
            delta.extend(success.vars);
            Ok((success.value, delta))
        }

        NodeBody::Branch(arms) => {
            let chosen = arms.iter().position(|arm| (arm.predicate)(&input));
            let Some(index) = chosen else {
                return Err(Halt::Failure(NodeFailure::new(
                    ErrorKind::TaskError,
                    label,
                    1,
                    "no matching branch arm",
                )));
            };
            run_transient_plan(ctx, &arms[index].body, input, delta, relabel).await
        }

        NodeBody::Parallel(arm_plans) => {
            let mut in_flight: FuturesUnordered<_> = arm_plans
                .iter()
                .enumerate()
                .map(|(k, arm)| {
                    let value = input.clone();
                    async move {
                        (
                            k,
                            run_transient_plan(ctx, arm, value, BTreeMap::new(), relabel).await,
                        )
                    }
                })
                .collect();
            let mut outputs: Vec<Value> = vec![Value::Null; arm_plans.len()];
            let mut arm_deltas: Vec<BTreeMap<String, Value>> =
                vec![BTreeMap::new(); arm_plans.len()];
            while let Some((k, outcome)) = in_flight.next().await {
                let (value, arm_delta) = outcome?;
                outputs[k] = value;
                arm_deltas[k] = arm_delta;
            }
            drop(in_flight);
            let mut seen: BTreeMap<&String, usize> = BTreeMap::new();
            for (k, arm_delta) in arm_deltas.iter().enumerate() {
                for key in arm_delta.keys() {
                    if let Some(other) = seen.get(key) {
                        if *other != k {
                            return Err(Halt::Failure(NodeFailure::new(
                                ErrorKind::ConcurrentVariableConflict,
                                label,
                                1,
                                format!("variable {key} written by concurrent arms"),
                            )));
                        }
                    }
                    seen.insert(key, k);
                }
            }
            for arm_delta in arm_deltas {
                delta.extend(arm_delta);
            }
            Ok((Value::Array(outputs), delta))
        }

        NodeBody::While {
            predicate,
            body,
            max_iterations,
        } => {
            let mut value = input;
            let mut iteration = 0u32;
            while (predicate)(&value) {
                if ctx.cancel.is_cancelled() {
                    return Err(Halt::Paused);
                }
                if iteration >= *max_iterations {
                    tracing::warn!(node_id = %label, max_iterations, "loop reached its iteration cap");
                    break;
                }
                iteration += 1;
                let iter_relabel = relabel.extended(
                    format!("{label}.loop.0"),
                    format!("{label}.iter.{iteration}"),
                );
                let (next, next_delta) =
                    run_transient_plan(ctx, body, value, delta, &iter_relabel).await?;
                value = next;
                delta = next_delta;
            }
            Ok((value, delta))
        }

        NodeBody::ForEach { body, concurrency } => {
            let Some(items) = input.as_array().cloned() else {
                return Err(Halt::Failure(NodeFailure::new(
                    ErrorKind::ValidationError,
                    label,
                    1,
                    "for_each input is not a sequence",
                )));
            };
            let make = |i: usize| {
                let item_relabel =
                    relabel.extended(format!("{label}.each.0"), format!("{label}.item.{i}"));
                let value = items[i].clone();
                async move {
                    (
                        i,
                        run_transient_plan(ctx, body, value, BTreeMap::new(), &item_relabel).await,
                    )
                }
            };
            let mut queue = 0..items.len();
            let mut in_flight = FuturesUnordered::new();
            for _ in 0..(*concurrency).max(1) {
                if let Some(i) = queue.next() {
                    in_flight.push(make(i));
                }
            }
            let mut outputs: Vec<Value> = vec![Value::Null; items.len()];
            let mut item_deltas: Vec<BTreeMap<String, Value>> =
                vec![BTreeMap::new(); items.len()];
            while let Some((i, outcome)) = in_flight.next().await {
                let (value, item_delta) = outcome?;
                outputs[i] = value;
                item_deltas[i] = item_delta;
                if let Some(next) = queue.next() {
                    in_flight.push(make(next));
                }
            }
            drop(in_flight);
            if *concurrency > 1 {
                let mut seen: BTreeMap<&String, usize> = BTreeMap::new();
                for (i, item_delta) in item_deltas.iter().enumerate() {
                    for key in item_delta.keys() {
                        if seen.get(key).is_some_and(|o| *o != i) {
                            return Err(Halt::Failure(NodeFailure::new(
                                ErrorKind::ConcurrentVariableConflict,
                                label.clone(),
                                1,
                                format!("variable {key} written by concurrent elements"),
                            )));
                        }
                        seen.insert(key, i);
                    }
                }
            }
            for item_delta in item_deltas {
                delta.extend(item_delta);
            }
            Ok((Value::Array(outputs), delta))
        }

        NodeBody::Nested(child_flow) => {
            let child_id = format!("{}/{}", ctx.execution_id, label);
            let child = ctx
                .sched
                .run_child(
                    child_flow.clone(),
                    input,
                    child_id,
                    ctx.execution_id.clone(),
                    ctx.cancel.clone(),
                )
                .await
                .map_err(Halt::Fatal)?;
            match child.status {
                ExecutionStatus::Completed => {
                    let output = child.final_output().cloned().unwrap_or(Value::Null);
                    Ok((output, delta))
                }
                ExecutionStatus::Paused => Err(Halt::Paused),
                _ => {
                    let kind = child
                        .failed
                        .last()
                        .map(|f| f.error_kind)
                        .unwrap_or(ErrorKind::TaskError);
                    Err(Halt::Failure(
                        NodeFailure::new(
                            kind,
                            label,
                            1,
                            format!("nested flow {} failed", child_flow.id()),
                        )
                        .with_detail(json!({ "child_execution_id": child.execution_id })),
                    ))
                }
            }
        }
    }
}
