//! The durable storage port.
//!
//! The engine depends only on the [`Storage`] trait: append-only snapshots
//! keyed by `(execution_id, version)`, an ordered event log, per-attempt
//! task results, execution listing, and TTL leases granting a single
//! scheduler the right to advance an execution. Snapshots are the
//! crash-safety unit — one is written at every node transition — while the
//! event log is the denormalized audit stream consumed by replay.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::events::EventRecord;
use crate::runtimes::ExecutionStatus;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Failures raised by a storage backend.
#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("snapshot already exists for execution {execution_id} at version {version}")]
    #[diagnostic(
        code(rillflow::storage::snapshot_exists),
        help("Snapshots are write-once; a duplicate version means two writers or a replayed put.")
    )]
    SnapshotExists { execution_id: String, version: u64 },

    #[error("{what} not found: {id}")]
    #[diagnostic(code(rillflow::storage::not_found))]
    NotFound { what: &'static str, id: String },

    #[error("execution {execution_id} is leased by {owner}")]
    #[diagnostic(
        code(rillflow::storage::lease_held),
        help("Wait for the lease to expire or be released before taking over.")
    )]
    LeaseHeld { execution_id: String, owner: String },

    #[error("lease on execution {execution_id} was lost")]
    #[diagnostic(code(rillflow::storage::lease_lost))]
    LeaseLost { execution_id: String },

    #[error("event log for {execution_id} expected seq {expected}, got {got}")]
    #[diagnostic(code(rillflow::storage::event_gap))]
    EventGap {
        execution_id: String,
        expected: u64,
        got: u64,
    },

    #[error("storage backend error: {message}")]
    #[diagnostic(code(rillflow::storage::backend))]
    Backend { message: String },

    #[error("storage serialization error: {source}")]
    #[diagnostic(code(rillflow::storage::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// The [`ErrorKind`] this failure surfaces as.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::LeaseHeld { .. } | StorageError::LeaseLost { .. } => ErrorKind::LeaseLost,
            _ => ErrorKind::StorageError,
        }
    }
}

/// Exclusive single-owner lease on an execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub execution_id: String,
    pub owner: String,
    pub token: String,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

/// Outcome classification of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Persisted record of one attempt of one node.
///
/// Successful records carry the produced output and the attempt's variable
/// writes; replay resolves `NodeSucceeded.output_ref` against these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResultRecord {
    pub node_id: String,
    pub attempt: u32,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Listing filter; all fields are conjunctive.
#[derive(Clone, Debug, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Pagination request.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Pagination metadata for a listing result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub total_count: u64,
    pub page_size: u32,
    pub offset: u32,
    pub has_next_page: bool,
}

/// One row of an execution listing.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub latest_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Paginated listing result.
#[derive(Clone, Debug)]
pub struct ExecutionPage {
    pub executions: Vec<ExecutionSummary>,
    pub page_info: PageInfo,
}

/// Abstract durable storage contract.
///
/// Implementations must make `put_snapshot` write-once per
/// `(execution_id, version)` and keep events strictly ordered by `seq`.
/// `append_event` and the snapshot that follows it should be staged
/// atomically where the backend allows it.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append an immutable snapshot at a monotonic version. Fails with
    /// [`StorageError::SnapshotExists`] if the version is already present.
    async fn put_snapshot(
        &self,
        execution_id: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Highest-version snapshot, or `None` when the execution is unknown.
    async fn latest_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<(u64, Vec<u8>)>, StorageError>;

    /// Every snapshot of an execution, ordered by version. Audit/replay
    /// surface; not needed on the hot path.
    async fn read_snapshots(
        &self,
        execution_id: &str,
    ) -> Result<Vec<(u64, Vec<u8>)>, StorageError>;

    /// Append to the ordered event log. `record.seq` must be the next
    /// sequence number.
    async fn append_event(&self, record: EventRecord) -> Result<(), StorageError>;

    /// Ordered events with `seq >= from_seq`.
    async fn read_events(
        &self,
        execution_id: &str,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Record an attempt outcome.
    async fn put_task_result(
        &self,
        execution_id: &str,
        record: TaskResultRecord,
    ) -> Result<(), StorageError>;

    /// Fetch one attempt outcome.
    async fn task_result(
        &self,
        execution_id: &str,
        node_id: &str,
        attempt: u32,
    ) -> Result<Option<TaskResultRecord>, StorageError>;

    /// Paginated listing by flow, status, and creation time.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: &Page,
    ) -> Result<ExecutionPage, StorageError>;

    /// Remove all records for an execution. Refused while a live lease is
    /// held on it.
    async fn delete_execution(&self, execution_id: &str) -> Result<(), StorageError>;

    /// Acquire the exclusive lease, failing with
    /// [`StorageError::LeaseHeld`] if another owner holds an unexpired one.
    async fn acquire_lease(
        &self,
        execution_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StorageError>;

    /// Extend a held lease by its original TTL.
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, StorageError>;

    /// Release a held lease.
    async fn release_lease(&self, lease: Lease) -> Result<(), StorageError>;
}

/// Build a listing row from a snapshot blob (backends index the same
/// fields the persisted execution record carries).
pub(crate) fn summarize_blob(
    execution_id: &str,
    version: u64,
    blob: &[u8],
) -> Result<ExecutionSummary, StorageError> {
    #[derive(Deserialize)]
    struct Indexed {
        flow_id: String,
        status: ExecutionStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }
    let indexed: Indexed = serde_json::from_slice(blob)?;
    Ok(ExecutionSummary {
        execution_id: execution_id.to_string(),
        flow_id: indexed.flow_id,
        status: indexed.status,
        latest_version: version,
        created_at: indexed.created_at,
        updated_at: indexed.updated_at,
    })
}
