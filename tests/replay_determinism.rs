//! Replay, snapshot immutability, and resume equivalence.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use rillflow::events::replay;
use rillflow::flows::flow;
use rillflow::schema::Schema;
use rillflow::storage::{Storage, StorageError};
use rillflow::ExecutionStatus;
use serde_json::{json, Value};

fn register_squares(scheduler: &rillflow::Scheduler, id: &str, delay_ms: u64) {
    scheduler
        .register_flow(
            flow(id)
                .for_each(square_slow(delay_ms))
                .compile(Schema::array(Schema::Integer))
                .unwrap(),
        )
        .unwrap();
}

#[tokio::test]
async fn completed_run_replays_to_identical_snapshots() {
    let (scheduler, storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("doubler")
                .then(double_as("double_first"))
                .then(double_as("double_second"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler
        .run_flow("doubler", json!({"value": 5}))
        .await
        .unwrap();

    assert_eq!(
        replay::first_divergence(storage.as_ref(), &exec.execution_id)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn failed_run_with_compensation_replays_cleanly() {
    let (scheduler, storage, _) = new_engine();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (boom, _) = always_fails("boom");
    scheduler
        .register_flow(
            flow("doomed")
                .then(compensatable("setup", log))
                .then(boom)
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("doomed", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        replay::first_divergence(storage.as_ref(), &exec.execution_id)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn snapshots_are_write_once() {
    let (scheduler, storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("doubler")
                .then(double_as("double"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();
    let exec = scheduler
        .run_flow("doubler", json!({"value": 1}))
        .await
        .unwrap();

    let err = storage
        .put_snapshot(&exec.execution_id, 0, b"{}".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::SnapshotExists { version: 0, .. }));
}

/// Strip the wallclock fields that are allowed to differ between an
/// interrupted and an uninterrupted run.
fn comparable(blob: &[u8]) -> Value {
    let mut value: Value = serde_json::from_slice(blob).unwrap();
    let map = value.as_object_mut().unwrap();
    map.remove("created_at");
    map.remove("updated_at");
    map.remove("execution_id");
    value
}

#[tokio::test]
async fn resumed_run_converges_on_the_uninterrupted_final_snapshot() {
    let (scheduler, storage, _) = new_engine();
    register_squares(&scheduler, "squares_paused", 40);
    register_squares(&scheduler, "squares_straight", 0);

    // Interrupted run.
    let paused_id = scheduler
        .start_execution("squares_paused", json!([1, 2, 3, 4]), no_metadata())
        .await
        .unwrap();
    let runner = {
        let scheduler = scheduler.clone();
        let id = paused_id.clone();
        tokio::spawn(async move { scheduler.run_to_completion(&id).await })
    };
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if storage.read_snapshots(&paused_id).await.unwrap().len() >= 3 {
            break;
        }
    }
    let _ = scheduler.pause(&paused_id);
    let paused = runner.await.unwrap().unwrap();
    if paused.status == ExecutionStatus::Paused {
        scheduler.resume(&paused_id).await.unwrap();
    }

    // Uninterrupted run of the same plan shape.
    let straight_id = scheduler
        .start_execution("squares_straight", json!([1, 2, 3, 4]), no_metadata())
        .await
        .unwrap();
    scheduler.run_to_completion(&straight_id).await.unwrap();

    let (_, paused_final) = storage.latest_snapshot(&paused_id).await.unwrap().unwrap();
    let (_, straight_final) = storage
        .latest_snapshot(&straight_id)
        .await
        .unwrap()
        .unwrap();

    let mut left = comparable(&paused_final);
    let mut right = comparable(&straight_final);
    // The two executions ran different flow ids; everything else matches.
    left.as_object_mut().unwrap().remove("flow_id");
    right.as_object_mut().unwrap().remove("flow_id");
    left.as_object_mut().unwrap().remove("definition_hash");
    right.as_object_mut().unwrap().remove("definition_hash");
    assert_eq!(left, right);
}
