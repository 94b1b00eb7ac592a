//! The execution record and its event-driven state transitions.
//!
//! [`Execution`] is the runtime state of one live run of a plan. It is
//! mutated exclusively through [`Execution::apply`], which consumes an
//! [`EventRecord`] and reports whether the transition demands a snapshot.
//! The live scheduler and the replay projection fold the same events
//! through the same function, which is what makes replayed snapshots
//! byte-identical to the originals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;
use crate::events::{EventRecord, ExecutionEvent};

/// Lifecycle of an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Compensating,
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// A finished node and the output key it persisted under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedNode {
    pub node_id: String,
    pub output_ref: String,
}

/// A node that failed terminally (or a compensation that failed).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedNode {
    pub node_id: String,
    pub error_kind: ErrorKind,
    pub detail: String,
}

/// Classification of a persisted output key.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InstanceKind {
    /// A compile-time node completing for good.
    Full,
    /// Partial progress of a composite node (`.item.N` / `.arm.N`).
    Partial,
    /// One settled loop iteration (`.iter.N`).
    LoopIteration { base: String, iteration: u32 },
}

/// Classify a node id appearing in a persisted `NodeSucceeded` event.
/// Runtime instances use the reserved segments `item`, `arm`, and `iter`,
/// which the compiler never emits.
pub(crate) fn instance_of(node_id: &str) -> InstanceKind {
    let mut segments = node_id.rsplitn(3, '.');
    let last = segments.next().unwrap_or_default();
    let middle = segments.next().unwrap_or_default();
    let rest = segments.next();
    if let Ok(index) = last.parse::<u32>() {
        match (middle, rest) {
            ("iter", Some(base)) => {
                return InstanceKind::LoopIteration {
                    base: base.to_string(),
                    iteration: index,
                }
            }
            ("item" | "arm", Some(_)) => return InstanceKind::Partial,
            _ => {}
        }
    }
    InstanceKind::Full
}

/// Runtime record of one execution of a flow.
///
/// The snapshot blob *is* this record, canonically serialized. Snapshot
/// version numbers and event sequence counters are storage keys, not
/// record fields, so a paused-and-resumed run converges on the same final
/// bytes as an uninterrupted one, timestamps aside.
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub execution_id: String,
    pub flow_id: String,
    pub definition_hash: String,
    pub status: ExecutionStatus,
    /// Most recently settled node; `"0"` before anything settles.
    pub cursor: String,
    pub completed: Vec<CompletedNode>,
    pub failed: Vec<FailedNode>,
    pub compensated: Vec<String>,
    pub compensation_errors: Vec<FailedNode>,
    /// Persisted outputs by key: full node ids plus `.item.N` / `.arm.N` /
    /// `.iter` partial-progress keys.
    pub outputs: BTreeMap<String, Value>,
    /// User scratch variables, merged from successful attempts.
    pub variables: BTreeMap<String, Value>,
    /// Iteration counters of in-flight `while` nodes.
    pub loops: BTreeMap<String, u32>,
    pub metadata: BTreeMap<String, Value>,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// An uninitialized record; populated by applying `ExecutionStarted`.
    #[must_use]
    pub fn empty(execution_id: &str) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            execution_id: execution_id.to_string(),
            flow_id: String::new(),
            definition_hash: String::new(),
            status: ExecutionStatus::Pending,
            cursor: "0".to_string(),
            completed: Vec::new(),
            failed: Vec::new(),
            compensated: Vec::new(),
            compensation_errors: Vec::new(),
            outputs: BTreeMap::new(),
            variables: BTreeMap::new(),
            loops: BTreeMap::new(),
            metadata: BTreeMap::new(),
            input: Value::Null,
            created_at: epoch,
            updated_at: epoch,
        }
    }

    #[must_use]
    pub fn is_node_completed(&self, node_id: &str) -> bool {
        self.completed.iter().any(|c| c.node_id == node_id)
    }

    /// Output stored under the given key, if any.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Final output of the execution, if it completed.
    #[must_use]
    pub fn final_output(&self) -> Option<&Value> {
        if self.status != ExecutionStatus::Completed {
            return None;
        }
        self.completed
            .last()
            .and_then(|c| self.outputs.get(&c.output_ref))
    }

    /// Apply one event to the record. Returns `true` when the transition
    /// must be followed by a snapshot.
    ///
    /// `resolve` maps `(node_id, attempt)` of a persisted `NodeSucceeded`
    /// to the attempt's output and variable writes; live execution hands
    /// in the value it just produced, replay looks up the stored task
    /// result.
    pub(crate) fn apply<F>(&mut self, record: &EventRecord, mut resolve: F) -> bool
    where
        F: FnMut(&str, u32) -> Option<(Value, BTreeMap<String, Value>)>,
    {
        let snapshot_due = match &record.event {
            ExecutionEvent::ExecutionStarted {
                flow_id,
                definition_hash,
                input,
                metadata,
            } => {
                self.execution_id = record.execution_id.clone();
                self.flow_id = flow_id.clone();
                self.definition_hash = definition_hash.clone();
                self.input = input.clone();
                self.metadata = metadata.clone();
                self.status = ExecutionStatus::Pending;
                self.cursor = "0".to_string();
                self.created_at = record.at;
                true
            }

            // Attempt bookkeeping lives in the task-result store; these
            // events are audit-only and never move the record.
            ExecutionEvent::NodeStarted { .. } | ExecutionEvent::RetryScheduled { .. } => false,
            ExecutionEvent::NodeSucceeded {
                output_ref: None, ..
            } => false,

            ExecutionEvent::NodeSucceeded {
                node_id,
                attempt,
                output_ref: Some(ref_key),
            } => match resolve(node_id, *attempt) {
                None => false,
                Some((output, vars)) => {
                    self.status = ExecutionStatus::Running;
                    self.outputs.insert(ref_key.clone(), output);
                    self.variables.extend(vars);
                    match instance_of(node_id) {
                        InstanceKind::LoopIteration { base, iteration } => {
                            self.loops.insert(base, iteration);
                        }
                        InstanceKind::Partial => {}
                        InstanceKind::Full => {
                            self.loops.remove(node_id);
                            self.completed.push(CompletedNode {
                                node_id: node_id.clone(),
                                output_ref: ref_key.clone(),
                            });
                            self.cursor = node_id.clone();
                        }
                    }
                    true
                }
            },

            ExecutionEvent::NodeFailed {
                node_id,
                error_kind,
                detail,
                ..
            } => {
                self.status = ExecutionStatus::Running;
                self.failed.push(FailedNode {
                    node_id: node_id.clone(),
                    error_kind: *error_kind,
                    detail: detail.clone(),
                });
                self.cursor = node_id.clone();
                true
            }

            ExecutionEvent::Paused { .. } => {
                self.status = ExecutionStatus::Paused;
                true
            }
            ExecutionEvent::Resumed { .. } => {
                self.status = ExecutionStatus::Running;
                true
            }
            ExecutionEvent::CompensationStarted => {
                self.status = ExecutionStatus::Compensating;
                true
            }
            ExecutionEvent::Compensated { node_id } => {
                self.compensated.push(node_id.clone());
                true
            }
            ExecutionEvent::CompensationFailed { node_id, detail } => {
                self.compensation_errors.push(FailedNode {
                    node_id: node_id.clone(),
                    error_kind: ErrorKind::CompensationError,
                    detail: detail.clone(),
                });
                true
            }
            ExecutionEvent::ExecutionCompleted { .. } => {
                self.status = ExecutionStatus::Completed;
                true
            }
            ExecutionEvent::ExecutionFailed { .. } => {
                self.status = ExecutionStatus::Failed;
                true
            }
        };

        if snapshot_due {
            self.updated_at = record.at;
        }
        snapshot_due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(seq: u64, event: ExecutionEvent) -> EventRecord {
        EventRecord {
            execution_id: "e1".into(),
            seq,
            at: Utc::now(),
            event,
        }
    }

    #[test]
    fn instance_classification() {
        assert_eq!(instance_of("0"), InstanceKind::Full);
        assert_eq!(instance_of("1.branch.0.2"), InstanceKind::Full);
        assert_eq!(instance_of("2.item.4"), InstanceKind::Partial);
        assert_eq!(instance_of("2.arm.1"), InstanceKind::Partial);
        assert_eq!(
            instance_of("3.iter.7"),
            InstanceKind::LoopIteration {
                base: "3".into(),
                iteration: 7
            }
        );
    }

    #[test]
    fn started_event_initializes_the_record() {
        let mut exec = Execution::empty("e1");
        let due = exec.apply(
            &record(
                0,
                ExecutionEvent::ExecutionStarted {
                    flow_id: "f".into(),
                    definition_hash: "h".into(),
                    input: json!({"value": 3}),
                    metadata: BTreeMap::new(),
                },
            ),
            |_, _| None,
        );
        assert!(due);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.flow_id, "f");
        assert_eq!(exec.input, json!({"value": 3}));
    }

    #[test]
    fn full_node_success_completes_and_moves_cursor() {
        let mut exec = Execution::empty("e1");
        let due = exec.apply(
            &record(
                1,
                ExecutionEvent::NodeSucceeded {
                    node_id: "0".into(),
                    attempt: 1,
                    output_ref: Some("0".into()),
                },
            ),
            |_, _| Some((json!({"result": 6}), BTreeMap::new())),
        );
        assert!(due);
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.cursor, "0");
        assert!(exec.is_node_completed("0"));
        assert_eq!(exec.outputs["0"], json!({"result": 6}));
    }

    #[test]
    fn transient_success_is_a_no_op() {
        let mut exec = Execution::empty("e1");
        let due = exec.apply(
            &record(
                1,
                ExecutionEvent::NodeSucceeded {
                    node_id: "2.item.0.0".into(),
                    attempt: 1,
                    output_ref: None,
                },
            ),
            |_, _| Some((json!(1), BTreeMap::new())),
        );
        assert!(!due);
        assert!(exec.completed.is_empty());
        assert!(exec.outputs.is_empty());
    }

    #[test]
    fn loop_iteration_tracks_progress_and_clears_on_completion() {
        let mut exec = Execution::empty("e1");
        exec.apply(
            &record(
                1,
                ExecutionEvent::NodeSucceeded {
                    node_id: "1.iter.2".into(),
                    attempt: 1,
                    output_ref: Some("1.iter".into()),
                },
            ),
            |_, _| Some((json!(8), BTreeMap::new())),
        );
        assert_eq!(exec.loops.get("1"), Some(&2));
        assert!(!exec.is_node_completed("1"));

        exec.apply(
            &record(
                2,
                ExecutionEvent::NodeSucceeded {
                    node_id: "1".into(),
                    attempt: 1,
                    output_ref: Some("1".into()),
                },
            ),
            |_, _| Some((json!(8), BTreeMap::new())),
        );
        assert!(exec.loops.is_empty());
        assert!(exec.is_node_completed("1"));
    }
}
