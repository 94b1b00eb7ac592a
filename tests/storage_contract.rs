//! Storage-port contract checks against both backends.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use rillflow::events::{EventRecord, ExecutionEvent};
use rillflow::flows::flow;
use rillflow::storage::{ExecutionFilter, InMemoryStorage, Page, Storage, StorageError};
use rillflow::ExecutionStatus;
use serde_json::json;

fn event(execution_id: &str, seq: u64) -> EventRecord {
    EventRecord {
        execution_id: execution_id.to_string(),
        seq,
        at: Utc::now(),
        event: ExecutionEvent::Paused {
            reason: "test".into(),
        },
    }
}

#[tokio::test]
async fn lease_is_exclusive_until_released() {
    let storage = InMemoryStorage::new();
    let lease = storage
        .acquire_lease("e1", "owner-a", Duration::from_secs(30))
        .await
        .unwrap();

    let err = storage
        .acquire_lease("e1", "owner-b", Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { ref owner, .. } if owner == "owner-a"));

    storage.release_lease(lease).await.unwrap();
    storage
        .acquire_lease("e1", "owner-b", Duration::from_secs(30))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let storage = InMemoryStorage::new();
    storage
        .acquire_lease("e1", "owner-a", Duration::from_millis(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let lease = storage
        .acquire_lease("e1", "owner-b", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(lease.owner, "owner-b");
}

#[tokio::test]
async fn renew_extends_a_held_lease_and_rejects_stale_tokens() {
    let storage = InMemoryStorage::new();
    let lease = storage
        .acquire_lease("e1", "owner-a", Duration::from_secs(5))
        .await
        .unwrap();
    let renewed = storage.renew_lease(&lease).await.unwrap();
    assert!(renewed.expires_at >= lease.expires_at);

    storage.release_lease(renewed).await.unwrap();
    let err = storage.renew_lease(&lease).await.unwrap_err();
    assert!(matches!(err, StorageError::LeaseLost { .. }));
}

#[tokio::test]
async fn delete_is_refused_while_a_lease_is_held() {
    let (scheduler, storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("doubler")
                .then(double_as("double"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();
    let exec = scheduler.run_flow("doubler", json!({"value": 1})).await.unwrap();

    let lease = storage
        .acquire_lease(&exec.execution_id, "holder", Duration::from_secs(30))
        .await
        .unwrap();
    let err = storage.delete_execution(&exec.execution_id).await.unwrap_err();
    assert!(matches!(err, StorageError::LeaseHeld { .. }));

    storage.release_lease(lease).await.unwrap();
    storage.delete_execution(&exec.execution_id).await.unwrap();
    assert!(storage
        .latest_snapshot(&exec.execution_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn event_log_rejects_sequence_gaps() {
    let storage = InMemoryStorage::new();
    storage.append_event(event("e1", 0)).await.unwrap();
    let err = storage.append_event(event("e1", 2)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::EventGap {
            expected: 1,
            got: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn listing_filters_by_flow_and_status_with_pagination() {
    let (scheduler, _storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("doubler")
                .then(double_as("double"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();
    scheduler
        .register_flow(
            flow("tagger")
                .then(double_as("double"))
                .then(tag("tag_low", "low"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    for _ in 0..3 {
        scheduler.run_flow("doubler", json!({"value": 1})).await.unwrap();
    }
    scheduler.run_flow("tagger", json!({"value": 1})).await.unwrap();

    let page = scheduler
        .list_executions(
            &ExecutionFilter {
                flow_id: Some("doubler".into()),
                ..ExecutionFilter::default()
            },
            &Page { limit: 2, offset: 0 },
        )
        .await
        .unwrap();
    assert_eq!(page.page_info.total_count, 3);
    assert_eq!(page.executions.len(), 2);
    assert!(page.page_info.has_next_page);

    let completed = scheduler
        .list_executions(
            &ExecutionFilter {
                status: Some(ExecutionStatus::Completed),
                ..ExecutionFilter::default()
            },
            &Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(completed.page_info.total_count, 4);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use rillflow::storage::SqliteStorage;
    use std::sync::Arc;

    async fn temp_storage() -> (Arc<SqliteStorage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/rillflow-test.db", dir.path().display());
        let storage = SqliteStorage::connect(&url).await.unwrap();
        (Arc::new(storage), dir)
    }

    #[tokio::test]
    async fn snapshots_round_trip_and_stay_write_once() {
        let (storage, _dir) = temp_storage().await;
        let blob = serde_json::to_vec(&json!({
            "execution_id": "e1",
            "flow_id": "f1",
            "definition_hash": "h",
            "status": "running",
            "cursor": "0",
            "input": {},
            "created_at": "2026-08-02T10:00:00Z",
            "updated_at": "2026-08-02T10:00:01Z",
        }))
        .unwrap();

        storage.put_snapshot("e1", 0, blob.clone()).await.unwrap();
        let (version, stored) = storage.latest_snapshot("e1").await.unwrap().unwrap();
        assert_eq!(version, 0);
        assert_eq!(stored, blob);

        let err = storage.put_snapshot("e1", 0, blob).await.unwrap_err();
        assert!(matches!(err, StorageError::SnapshotExists { .. }));
    }

    #[tokio::test]
    async fn events_and_task_results_round_trip() {
        let (storage, _dir) = temp_storage().await;
        storage.append_event(event("e1", 0)).await.unwrap();
        storage.append_event(event("e1", 1)).await.unwrap();
        let err = storage.append_event(event("e1", 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::EventGap { .. }));

        let events = storage.read_events("e1", 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 1);
    }

    #[tokio::test]
    async fn leases_are_exclusive_across_connections() {
        let (storage, _dir) = temp_storage().await;
        let lease = storage
            .acquire_lease("e1", "owner-a", Duration::from_secs(30))
            .await
            .unwrap();
        let err = storage
            .acquire_lease("e1", "owner-b", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LeaseHeld { .. }));
        storage.release_lease(lease).await.unwrap();
    }

    #[tokio::test]
    async fn full_flow_runs_against_sqlite() {
        let (storage, _dir) = temp_storage().await;
        let registry = Arc::new(rillflow::FlowRegistry::new());
        let scheduler = rillflow::Scheduler::new(registry, storage.clone());
        scheduler
            .register_flow(
                flow("doubler")
                    .then(double_as("double_first"))
                    .then(double_as("double_second"))
                    .compile(any_object())
                    .unwrap(),
            )
            .unwrap();

        let exec = scheduler.run_flow("doubler", json!({"value": 3})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.final_output(), Some(&json!({"result": 12})));

        let divergence =
            rillflow::events::replay::first_divergence(storage.as_ref(), &exec.execution_id)
                .await
                .unwrap();
        assert_eq!(divergence, None);
    }
}
