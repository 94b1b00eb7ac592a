//! Loops, nesting, variables, and control-plane operations.

mod common;

use std::sync::Arc;

use common::*;
use rillflow::events::replay;
use rillflow::flows::{flow, when, Subflow};
use rillflow::runtimes::{FlowRegistry, Scheduler};
use rillflow::schema::Schema;
use rillflow::storage::{ExecutionFilter, Page, Storage};
use rillflow::task::task_fn;
use rillflow::{ErrorKind, ExecutionStatus, SchedulerError};
use serde_json::json;

fn decrement() -> rillflow::FnTask {
    task_fn(
        "decrement",
        Schema::object([("n", Schema::Integer)]),
        Schema::object([("n", Schema::Integer)]),
        |input, _ctx| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(json!({"n": n - 1}))
        },
    )
}

#[tokio::test]
async fn while_loop_runs_until_the_predicate_fails() {
    let (scheduler, storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("countdown")
                .while_(when(|v| v["n"].as_i64().unwrap_or(0) > 0), decrement())
                .compile(Schema::object([("n", Schema::Integer)]))
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("countdown", json!({"n": 3})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.final_output(), Some(&json!({"n": 0})));
    assert!(exec.loops.is_empty());
    assert_eq!(exec.outputs["0.iter"], json!({"n": 0}));

    assert_eq!(
        replay::first_divergence(storage.as_ref(), &exec.execution_id)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn while_loop_stops_at_its_iteration_cap() {
    let (scheduler, _storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("spinner")
                .while_bounded(when(|_| true), decrement(), 5)
                .compile(Schema::object([("n", Schema::Integer)]))
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("spinner", json!({"n": 3})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.final_output(), Some(&json!({"n": -2})));
}

#[tokio::test]
async fn branch_without_a_matching_arm_fails_the_node() {
    let (scheduler, _storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("unmatched")
                .then(double_as("double"))
                .branch(vec![(
                    when(|v| v["result"].as_i64().unwrap_or(0) > 1000),
                    Subflow::step(tag("tag_high", "high")),
                )])
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("unmatched", json!({"value": 2})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failed[0].node_id, "1");
    assert_eq!(exec.failed[0].error_kind, ErrorKind::TaskError);
    assert!(exec.failed[0].detail.contains("no matching branch arm"));
}

#[tokio::test]
async fn nested_flow_runs_as_a_linked_child_execution() {
    let (scheduler, storage, _) = new_engine();
    let child = Arc::new(
        flow("child_doubler")
            .then(double_as("double"))
            .compile(any_object())
            .unwrap(),
    );
    scheduler
        .register_flow(
            flow("parent")
                .then(add_k("add_one", 1, 0))
                .nested(child)
                .compile(Schema::object([("value", Schema::Integer)]))
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("parent", json!({"value": 4})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.final_output(), Some(&json!({"result": 10})));

    // The child is a real execution, linked back to its parent.
    let child_id = format!("{}/1", exec.execution_id);
    let (_, blob) = storage.latest_snapshot(&child_id).await.unwrap().unwrap();
    let child_state: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(child_state["status"], json!("completed"));
    assert_eq!(
        child_state["metadata"]["parent_execution_id"],
        json!(exec.execution_id)
    );
}

#[tokio::test]
async fn variables_are_written_through_the_context_and_snapshotted() {
    let (scheduler, storage, _) = new_engine();
    let noting = task_fn("noting", Schema::Any, Schema::Any, |input, ctx| async move {
        ctx.set_variable("seen_by", json!(ctx.node_id()));
        Ok(input)
    });
    scheduler
        .register_flow(flow("noting_flow").then(noting).compile(Schema::Any).unwrap())
        .unwrap();

    let exec = scheduler.run_flow("noting_flow", json!(1)).await.unwrap();
    assert_eq!(exec.variables["seen_by"], json!("0"));

    let (_, blob) = storage
        .latest_snapshot(&exec.execution_id)
        .await
        .unwrap()
        .unwrap();
    let persisted: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(persisted["variables"]["seen_by"], json!("0"));
}

#[tokio::test]
async fn concurrent_arms_writing_the_same_variable_fail_the_node() {
    let (scheduler, _storage, _) = new_engine();
    let writer = |id: &str| {
        task_fn(id, Schema::Any, Schema::Any, |input, ctx| async move {
            ctx.set_variable("winner", json!(ctx.node_id()));
            Ok(input)
        })
    };
    scheduler
        .register_flow(
            flow("contended")
                .parallel(vec![
                    Subflow::step(writer("left")),
                    Subflow::step(writer("right")),
                ])
                .compile(Schema::Any)
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("contended", json!(1)).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.failed[0].error_kind,
        ErrorKind::ConcurrentVariableConflict
    );
}

#[tokio::test]
async fn control_plane_describe_list_delete() {
    let (scheduler, _storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("doubler")
                .then(double_as("double"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("doubler", json!({"value": 2})).await.unwrap();

    let described = scheduler.describe_execution(&exec.execution_id).await.unwrap();
    assert_eq!(described.status, ExecutionStatus::Completed);
    assert_eq!(described.flow_id, "doubler");
    assert_eq!(described.completed.len(), 1);

    let listed = scheduler
        .list_executions(
            &ExecutionFilter {
                flow_id: Some("doubler".into()),
                status: Some(ExecutionStatus::Completed),
                ..ExecutionFilter::default()
            },
            &Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(listed.page_info.total_count, 1);
    assert_eq!(listed.executions[0].execution_id, exec.execution_id);

    scheduler.delete_execution(&exec.execution_id).await.unwrap();
    let err = scheduler.describe_execution(&exec.execution_id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ExecutionNotFound { .. }));
}

#[tokio::test]
async fn invalid_input_is_rejected_at_start() {
    let (scheduler, _storage, _) = new_engine();
    scheduler
        .register_flow(
            flow("typed")
                .then(add_k("add_one", 1, 0))
                .compile(Schema::object([("value", Schema::Integer)]))
                .unwrap(),
        )
        .unwrap();

    let err = scheduler
        .start_execution("typed", json!({"value": "nope"}), no_metadata())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidInput { .. }));
}

#[tokio::test]
async fn changed_definition_refuses_to_resume_in_flight_executions() {
    let storage: Arc<rillflow::storage::InMemoryStorage> =
        Arc::new(rillflow::storage::InMemoryStorage::new());

    let registry_a = Arc::new(FlowRegistry::new());
    let scheduler_a = Scheduler::new(registry_a, storage.clone());
    scheduler_a
        .register_flow(
            flow("shifting")
                .then(double_as("double"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();
    let execution_id = scheduler_a
        .start_execution("shifting", json!({"value": 1}), no_metadata())
        .await
        .unwrap();

    // A second process registers a changed composition under the same id.
    let registry_b = Arc::new(FlowRegistry::new());
    let scheduler_b = Scheduler::new(registry_b, storage.clone());
    scheduler_b
        .register_flow(
            flow("shifting")
                .then(double_as("double"))
                .then(tag("tag_low", "low"))
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let err = scheduler_b.run_to_completion(&execution_id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DefinitionDrift { .. }));
}

#[tokio::test]
async fn pausing_an_idle_execution_is_an_error() {
    let (scheduler, _storage, _) = new_engine();
    let err = scheduler.pause("nope").unwrap_err();
    assert!(matches!(err, SchedulerError::NotRunning { .. }));
}
