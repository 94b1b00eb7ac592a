//! Runtime infrastructure: execution records, snapshot persistence, the
//! flow registry, and the scheduler.
//!
//! The runtime is built around a handful of abstractions:
//!
//! - [`Execution`] — the durable state of one run, mutated only by
//!   applying events.
//! - [`persistence`] — serde shapes and canonical encoding for snapshots.
//! - [`FlowRegistry`] — the explicit flow-id → plan map handed to hosts.
//! - [`Scheduler`] — drives executions, owning leases, policies, pause
//!   and resume.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rillflow::flows::flow;
//! use rillflow::runtimes::{FlowRegistry, Scheduler};
//! use rillflow::schema::Schema;
//! use rillflow::storage::InMemoryStorage;
//! use rillflow::task::task_fn;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(FlowRegistry::new());
//! let scheduler = Scheduler::new(registry.clone(), Arc::new(InMemoryStorage::new()));
//!
//! let echo = task_fn("echo", Schema::Any, Schema::Any, |input, _ctx| async move { Ok(input) });
//! scheduler.register_flow(flow("echo-flow").then(echo).compile(Schema::Any)?)?;
//!
//! let done = scheduler.run_flow("echo-flow", json!({"hello": "world"})).await?;
//! assert_eq!(done.final_output(), Some(&json!({"hello": "world"})));
//! # Ok(())
//! # }
//! ```

pub mod execution;
pub mod persistence;
pub mod registry;
pub mod scheduler;

pub use execution::{CompletedNode, Execution, ExecutionStatus, FailedNode};
pub use persistence::{PersistedExecution, PersistenceError};
pub use registry::{FlowInfo, FlowRegistry, NodeInfo, RegistryError};
pub use scheduler::{ExecutionDescription, Scheduler, SchedulerConfig, SchedulerError};
