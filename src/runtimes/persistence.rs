/*!
Persistence models for execution snapshots.

Explicit serde structs decoupled from the in-memory [`Execution`] record,
with conversions localized here so storage code stays lean. Snapshot blobs
are canonical key-sorted JSON: replaying an event log must reproduce the
original bytes, so nothing nondeterministic (map iteration order, float
formatting surprises) may reach the encoder.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::canonical;

use super::execution::{CompletedNode, Execution, ExecutionStatus, FailedNode};

/// Snapshot blob shape. Field names are part of the storage format; the
/// SQLite backend additionally indexes `flow_id`, `status`, and the two
/// timestamps straight out of this JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedExecution {
    pub execution_id: String,
    pub flow_id: String,
    pub definition_hash: String,
    pub status: ExecutionStatus,
    pub cursor: String,
    #[serde(default)]
    pub completed: Vec<CompletedNode>,
    #[serde(default)]
    pub failed: Vec<FailedNode>,
    #[serde(default)]
    pub compensated: Vec<String>,
    #[serde(default)]
    pub compensation_errors: Vec<FailedNode>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub loops: BTreeMap<String, u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversion and serialization failures for persistence models.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("snapshot serialization failed: {source}")]
    #[diagnostic(
        code(rillflow::persistence::serde),
        help("Ensure the blob matches the PersistedExecution shape.")
    )]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl From<&Execution> for PersistedExecution {
    fn from(exec: &Execution) -> Self {
        PersistedExecution {
            execution_id: exec.execution_id.clone(),
            flow_id: exec.flow_id.clone(),
            definition_hash: exec.definition_hash.clone(),
            status: exec.status,
            cursor: exec.cursor.clone(),
            completed: exec.completed.clone(),
            failed: exec.failed.clone(),
            compensated: exec.compensated.clone(),
            compensation_errors: exec.compensation_errors.clone(),
            outputs: exec.outputs.clone(),
            variables: exec.variables.clone(),
            loops: exec.loops.clone(),
            metadata: exec.metadata.clone(),
            input: exec.input.clone(),
            created_at: exec.created_at,
            updated_at: exec.updated_at,
        }
    }
}

impl From<PersistedExecution> for Execution {
    fn from(p: PersistedExecution) -> Self {
        Execution {
            execution_id: p.execution_id,
            flow_id: p.flow_id,
            definition_hash: p.definition_hash,
            status: p.status,
            cursor: p.cursor,
            completed: p.completed,
            failed: p.failed,
            compensated: p.compensated,
            compensation_errors: p.compensation_errors,
            outputs: p.outputs,
            variables: p.variables,
            loops: p.loops,
            metadata: p.metadata,
            input: p.input,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// Encode an execution as a canonical snapshot blob.
pub fn to_blob(exec: &Execution) -> Result<Vec<u8>, PersistenceError> {
    Ok(canonical::to_canonical_vec(&PersistedExecution::from(exec))?)
}

/// Decode a snapshot blob back into an execution record.
pub fn from_blob(blob: &[u8]) -> Result<Execution, PersistenceError> {
    let persisted: PersistedExecution = serde_json::from_slice(blob)?;
    Ok(persisted.into())
}
