//! Volatile storage for tests and development.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;

use crate::events::EventRecord;

use super::{
    summarize_blob, ExecutionFilter, ExecutionPage, ExecutionSummary, Lease, Page, PageInfo,
    Storage, StorageError, TaskResultRecord,
};

#[derive(Default)]
struct Inner {
    snapshots: FxHashMap<String, BTreeMap<u64, Vec<u8>>>,
    events: FxHashMap<String, Vec<EventRecord>>,
    results: FxHashMap<String, FxHashMap<(String, u32), TaskResultRecord>>,
    leases: FxHashMap<String, Lease>,
}

impl Inner {
    /// A live (unexpired) lease on the execution, if any.
    fn live_lease(&mut self, execution_id: &str) -> Option<&Lease> {
        let expired = self
            .leases
            .get(execution_id)
            .is_some_and(|lease| lease.expires_at <= Utc::now());
        if expired {
            self.leases.remove(execution_id);
        }
        self.leases.get(execution_id)
    }
}

/// In-memory [`Storage`] with full contract semantics, including leases
/// and write-once snapshots. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_snapshot(
        &self,
        execution_id: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        let versions = inner.snapshots.entry(execution_id.to_string()).or_default();
        if versions.contains_key(&version) {
            return Err(StorageError::SnapshotExists {
                execution_id: execution_id.to_string(),
                version,
            });
        }
        versions.insert(version, blob);
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().expect("storage poisoned");
        Ok(inner
            .snapshots
            .get(execution_id)
            .and_then(|versions| versions.iter().next_back())
            .map(|(v, blob)| (*v, blob.clone())))
    }

    async fn read_snapshots(
        &self,
        execution_id: &str,
    ) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().expect("storage poisoned");
        Ok(inner
            .snapshots
            .get(execution_id)
            .map(|versions| {
                versions
                    .iter()
                    .map(|(v, blob)| (*v, blob.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_event(&self, record: EventRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        let log = inner.events.entry(record.execution_id.clone()).or_default();
        let expected = log.len() as u64;
        if record.seq != expected {
            return Err(StorageError::EventGap {
                execution_id: record.execution_id,
                expected,
                got: record.seq,
            });
        }
        log.push(record);
        Ok(())
    }

    async fn read_events(
        &self,
        execution_id: &str,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let inner = self.inner.lock().expect("storage poisoned");
        Ok(inner
            .events
            .get(execution_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_task_result(
        &self,
        execution_id: &str,
        record: TaskResultRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        inner
            .results
            .entry(execution_id.to_string())
            .or_default()
            .insert((record.node_id.clone(), record.attempt), record);
        Ok(())
    }

    async fn task_result(
        &self,
        execution_id: &str,
        node_id: &str,
        attempt: u32,
    ) -> Result<Option<TaskResultRecord>, StorageError> {
        let inner = self.inner.lock().expect("storage poisoned");
        Ok(inner
            .results
            .get(execution_id)
            .and_then(|results| results.get(&(node_id.to_string(), attempt)))
            .cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: &Page,
    ) -> Result<ExecutionPage, StorageError> {
        let inner = self.inner.lock().expect("storage poisoned");
        let mut rows: Vec<ExecutionSummary> = Vec::new();
        for (execution_id, versions) in &inner.snapshots {
            let Some((version, blob)) = versions.iter().next_back() else {
                continue;
            };
            let summary = summarize_blob(execution_id, *version, blob)?;
            let keep = filter
                .flow_id
                .as_ref()
                .is_none_or(|f| *f == summary.flow_id)
                && filter.status.is_none_or(|s| s == summary.status)
                && filter.created_after.is_none_or(|t| summary.created_at >= t)
                && filter.created_before.is_none_or(|t| summary.created_at <= t);
            if keep {
                rows.push(summary);
            }
        }
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.execution_id.cmp(&b.execution_id)));

        let total_count = rows.len() as u64;
        let start = (page.offset as usize).min(rows.len());
        let end = (start + page.limit as usize).min(rows.len());
        let executions = rows[start..end].to_vec();
        let page_info = PageInfo {
            total_count,
            page_size: executions.len() as u32,
            offset: page.offset,
            has_next_page: (end as u64) < total_count,
        };
        Ok(ExecutionPage {
            executions,
            page_info,
        })
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        if let Some(lease) = inner.live_lease(execution_id) {
            return Err(StorageError::LeaseHeld {
                execution_id: execution_id.to_string(),
                owner: lease.owner.clone(),
            });
        }
        inner.snapshots.remove(execution_id);
        inner.events.remove(execution_id);
        inner.results.remove(execution_id);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        execution_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        if let Some(held) = inner.live_lease(execution_id) {
            return Err(StorageError::LeaseHeld {
                execution_id: execution_id.to_string(),
                owner: held.owner.clone(),
            });
        }
        let lease = Lease {
            execution_id: execution_id.to_string(),
            owner: owner.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
        };
        inner.leases.insert(execution_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        match inner.leases.get_mut(&lease.execution_id) {
            Some(held) if held.token == lease.token => {
                held.expires_at = Utc::now()
                    + chrono::Duration::from_std(held.ttl)
                        .unwrap_or(chrono::Duration::seconds(30));
                Ok(held.clone())
            }
            _ => Err(StorageError::LeaseLost {
                execution_id: lease.execution_id.clone(),
            }),
        }
    }

    async fn release_lease(&self, lease: Lease) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("storage poisoned");
        match inner.leases.get(&lease.execution_id) {
            Some(held) if held.token == lease.token => {
                inner.leases.remove(&lease.execution_id);
                Ok(())
            }
            _ => Err(StorageError::LeaseLost {
                execution_id: lease.execution_id,
            }),
        }
    }
}
