//! ```text
//! FlowBuilder ─┬─► FlowBuilder::compile ─► Flow (Plan) ─► FlowRegistry
//!              │                                          │
//!              │                                          ▼
//!              │                          Scheduler ─► Driver ─► Tasks
//!              │                          │                      │
//!              │                          ├─► Policies (retry / circuit / compensation)
//!              │                          ├─► EventBus (observers)
//!              │                          └─► Storage (snapshots / events / leases)
//!              │
//!              └─► Schemas type-check the composition end-to-end
//! ```
//!
//! Rillflow is a durable workflow orchestration engine: workflows are
//! declared with a fluent composition API (`then`, `branch`, `parallel`,
//! `while_`, `for_each`, `nested`), compiled into an immutable typed
//! plan, and driven by a scheduler that persists a snapshot at every node
//! transition. An interrupted execution resumes from its latest snapshot
//! under an exclusive storage lease; failures flow through per-task retry
//! policies and circuit breakers, and terminal failures unwind through
//! compensation in reverse completion order.

pub mod errors;
pub mod events;
pub mod flows;
pub mod plan;
pub mod policies;
pub mod runtimes;
pub mod schema;
pub mod storage;
pub mod task;
pub mod utils;

pub use errors::{ErrorKind, NodeFailure};
pub use flows::{flow, when, CompileError, Flow, FlowBuilder, Subflow};
pub use runtimes::{
    Execution, ExecutionStatus, FlowRegistry, Scheduler, SchedulerConfig, SchedulerError,
};
pub use schema::Schema;
pub use task::{task_fn, FnTask, Task, TaskContext, TaskError};
