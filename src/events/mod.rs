//! Execution events: the durable audit stream and its in-process transport.
//!
//! Every state transition of an execution is recorded as an
//! [`ExecutionEvent`] wrapped in an [`EventRecord`] carrying the execution
//! id, a monotonic sequence number, and a wallclock timestamp. Records are
//! appended to the storage event log at the same transactional boundary as
//! the snapshot they caused, and simultaneously broadcast on the in-process
//! [`EventBus`](bus::EventBus) for observers; the engine itself never reads
//! the bus back.

mod bus;
pub mod replay;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::ErrorKind;

pub use bus::{EventBus, EventEmitter, EventSink, MemorySink, TracingSink};

/// Closed set of execution state transitions.
///
/// `NodeSucceeded` events with `output_ref: Some(_)` persist an output and
/// force a snapshot; with `None` they are transient audit records for
/// attempts inside loop iterations and fan-out arms, and leave the
/// execution record untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        flow_id: String,
        definition_hash: String,
        input: Value,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
    },
    NodeStarted {
        node_id: String,
        attempt: u32,
    },
    NodeSucceeded {
        node_id: String,
        attempt: u32,
        output_ref: Option<String>,
    },
    NodeFailed {
        node_id: String,
        attempt: u32,
        error_kind: ErrorKind,
        detail: String,
    },
    RetryScheduled {
        node_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    Paused {
        reason: String,
    },
    Resumed {
        owner: String,
    },
    CompensationStarted,
    Compensated {
        node_id: String,
    },
    CompensationFailed {
        node_id: String,
        detail: String,
    },
    ExecutionCompleted {
        final_output_ref: String,
    },
    ExecutionFailed {
        error_kind: ErrorKind,
    },
}

impl ExecutionEvent {
    /// Short label for logging and bus sinks.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "execution_started",
            ExecutionEvent::NodeStarted { .. } => "node_started",
            ExecutionEvent::NodeSucceeded { .. } => "node_succeeded",
            ExecutionEvent::NodeFailed { .. } => "node_failed",
            ExecutionEvent::RetryScheduled { .. } => "retry_scheduled",
            ExecutionEvent::Paused { .. } => "paused",
            ExecutionEvent::Resumed { .. } => "resumed",
            ExecutionEvent::CompensationStarted => "compensation_started",
            ExecutionEvent::Compensated { .. } => "compensated",
            ExecutionEvent::CompensationFailed { .. } => "compensation_failed",
            ExecutionEvent::ExecutionCompleted { .. } => "execution_completed",
            ExecutionEvent::ExecutionFailed { .. } => "execution_failed",
        }
    }

    /// The node this event concerns, when it concerns one.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeStarted { node_id, .. }
            | ExecutionEvent::NodeSucceeded { node_id, .. }
            | ExecutionEvent::NodeFailed { node_id, .. }
            | ExecutionEvent::RetryScheduled { node_id, .. }
            | ExecutionEvent::Compensated { node_id }
            | ExecutionEvent::CompensationFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A persisted event log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub execution_id: String,
    /// Monotonic per-execution sequence number, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}
