//! Replay: project an event log back into snapshots.
//!
//! Folds an execution's events through the same transition function the
//! live scheduler uses, resolving persisted outputs against the stored
//! task results. For every execution the projected blobs byte-compare
//! equal to the snapshots the live run wrote, which is both an audit tool
//! and the test harness for the engine's determinism guarantee.

use std::collections::BTreeMap;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::events::ExecutionEvent;
use crate::runtimes::persistence::{self, PersistenceError};
use crate::runtimes::Execution;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error, Diagnostic)]
pub enum ReplayError {
    #[error(transparent)]
    #[diagnostic(code(rillflow::replay::storage))]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(code(rillflow::replay::persistence))]
    Persistence(#[from] PersistenceError),
}

/// Rebuild every snapshot of an execution from its event log alone.
/// Returns `(version, blob)` pairs in version order.
pub async fn project_snapshots(
    storage: &dyn Storage,
    execution_id: &str,
) -> Result<Vec<(u64, Vec<u8>)>, ReplayError> {
    let events = storage.read_events(execution_id, 0).await?;

    // Pre-resolve the output of every persisted NodeSucceeded; apply()
    // itself is synchronous.
    let mut resolutions: FxHashMap<(String, u32), (Value, BTreeMap<String, Value>)> =
        FxHashMap::default();
    for record in &events {
        if let ExecutionEvent::NodeSucceeded {
            node_id,
            attempt,
            output_ref: Some(_),
        } = &record.event
        {
            if let Some(result) = storage.task_result(execution_id, node_id, *attempt).await? {
                if let Some(output) = result.output {
                    resolutions.insert((node_id.clone(), *attempt), (output, result.variables));
                }
            }
        }
    }

    let mut exec = Execution::empty(execution_id);
    let mut version = 0u64;
    let mut projected = Vec::new();
    for record in &events {
        let due = exec.apply(record, |node_id, attempt| {
            resolutions.get(&(node_id.to_string(), attempt)).cloned()
        });
        if due {
            projected.push((version, persistence::to_blob(&exec)?));
            version += 1;
        }
    }
    Ok(projected)
}

/// Compare the projected snapshots against the stored ones byte-for-byte.
/// Returns the first diverging version, or `None` when the log replays
/// cleanly.
pub async fn first_divergence(
    storage: &dyn Storage,
    execution_id: &str,
) -> Result<Option<u64>, ReplayError> {
    let stored = storage.read_snapshots(execution_id).await?;
    let projected = project_snapshots(storage, execution_id).await?;
    if stored.len() != projected.len() {
        let diverging = stored.len().min(projected.len()) as u64;
        return Ok(Some(diverging));
    }
    for ((stored_version, stored_blob), (projected_version, projected_blob)) in
        stored.iter().zip(&projected)
    {
        if stored_version != projected_version || stored_blob != projected_blob {
            return Ok(Some(*stored_version));
        }
    }
    Ok(None)
}
