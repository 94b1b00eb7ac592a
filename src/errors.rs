//! Error taxonomy shared across the engine.
//!
//! [`ErrorKind`] is the closed set of failure categories that crosses the
//! engine boundary: it is what retry predicates inspect, what circuit
//! breakers count, and what the event log records. Module-specific error
//! enums (compile, storage, scheduler) live next to the code that raises
//! them; they collapse into an `ErrorKind` whenever a failure has to be
//! persisted or surfaced to a caller.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Closed set of failure categories surfaced by the engine.
///
/// The serialized names are part of the persisted event format; adding a
/// variant is a storage-format change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Payload rejected by a schema check. Never retried.
    ValidationError,
    /// The task's own execute (or compensate) capability failed.
    TaskError,
    /// A per-attempt deadline elapsed. Consumes retry budget.
    Timeout,
    /// The attempt was cooperatively cancelled. Does not consume retry budget.
    Cancelled,
    /// Short-circuited by an open circuit breaker. Never retried.
    CircuitOpen,
    /// Flow failed to compile; never observed at runtime.
    CompileError,
    /// A compensation capability failed while unwinding.
    CompensationError,
    /// The storage backend failed.
    StorageError,
    /// The exclusive execution lease was lost or expired.
    LeaseLost,
    /// Two concurrent arms wrote the same variable key.
    ConcurrentVariableConflict,
}

impl ErrorKind {
    /// Stable string form, identical to the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::TaskError => "TaskError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::CompileError => "CompileError",
            ErrorKind::CompensationError => "CompensationError",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::LeaseLost => "LeaseLost",
            ErrorKind::ConcurrentVariableConflict => "ConcurrentVariableConflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-described node failure as surfaced to callers and persisted in
/// snapshots.
///
/// Carries everything §7 of the failure contract requires: the kind, a
/// human message, the offending node, the attempt number, and the original
/// task detail serialized safely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error, Diagnostic)]
#[error("{kind} at node {node_id} (attempt {attempt}): {message}")]
#[diagnostic(code(rillflow::node_failure))]
pub struct NodeFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub node_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub detail: Value,
}

impl NodeFailure {
    pub fn new(
        kind: ErrorKind,
        node_id: impl Into<String>,
        attempt: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: node_id.into(),
            attempt,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}
