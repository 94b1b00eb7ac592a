//! Retry, timeout, and circuit-breaker behavior through the scheduler.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use rillflow::flows::flow;
use rillflow::policies::{Backoff, BreakerState, CircuitBreakerConfig, RetryPolicy};
use rillflow::runtimes::SchedulerConfig;
use rillflow::schema::Schema;
use rillflow::storage::{AttemptStatus, Storage};
use rillflow::task::task_fn;
use rillflow::{ErrorKind, ExecutionStatus};
use serde_json::json;

#[tokio::test]
async fn timeout_counts_against_retry_budget() {
    let (scheduler, storage, _) = new_engine();
    let sleepy = task_fn("sleepy", Schema::Any, Schema::Any, |input, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(input)
    })
    .with_timeout(Duration::from_millis(20))
    .with_retry_policy(RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(10))));

    scheduler
        .register_flow(flow("slow").then(sleepy).compile(Schema::Any).unwrap())
        .unwrap();

    let exec = scheduler.run_flow("slow", json!(1)).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failed[0].error_kind, ErrorKind::Timeout);

    for attempt in 1..=2 {
        let result = storage
            .task_result(&exec.execution_id, "0", attempt)
            .await
            .unwrap()
            .expect("attempt result recorded");
        assert_eq!(result.status, AttemptStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }
}

#[tokio::test]
async fn validation_failure_is_never_retried() {
    let (scheduler, storage, _) = new_engine();
    let strict = task_fn(
        "strict",
        Schema::object([("value", Schema::Integer)]),
        Schema::Any,
        |input, _ctx| async move { Ok(input) },
    )
    .with_retry_policy(RetryPolicy::new(5, Backoff::Fixed(Duration::ZERO)));

    scheduler
        .register_flow(flow("strict_flow").then(strict).compile(Schema::Any).unwrap())
        .unwrap();

    // Flow-level input is unconstrained; the task's own schema rejects it.
    let exec = scheduler
        .run_flow("strict_flow", json!({"value": "three"}))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failed[0].error_kind, ErrorKind::ValidationError);

    // Exactly one attempt was recorded.
    assert!(storage
        .task_result(&exec.execution_id, "0", 2)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_short_circuits_later_runs() {
    let config = SchedulerConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        },
        ..SchedulerConfig::default()
    };
    let (scheduler, _storage, _) = new_engine_with(config);
    let (task, calls) = always_fails("brittle");
    scheduler
        .register_flow(flow("brittle_flow").then(task).compile(any_object()).unwrap())
        .unwrap();

    for _ in 0..2 {
        let exec = scheduler.run_flow("brittle_flow", json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failed[0].error_kind, ErrorKind::TaskError);
    }
    assert_eq!(scheduler.breakers().state_of("brittle"), BreakerState::Open);

    // Third run short-circuits without invoking the task.
    let exec = scheduler.run_flow("brittle_flow", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.failed[0].error_kind, ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn half_open_probe_closes_the_circuit_on_success() {
    let config = SchedulerConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(20),
        },
        ..SchedulerConfig::default()
    };
    let (scheduler, _storage, _) = new_engine_with(config);
    let (task, _calls) = flaky("recovering", 1);
    scheduler
        .register_flow(
            flow("recovering_flow")
                .then(task)
                .compile(any_object())
                .unwrap(),
        )
        .unwrap();

    let exec = scheduler.run_flow("recovering_flow", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(scheduler.breakers().state_of("recovering"), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let exec = scheduler.run_flow("recovering_flow", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(
        scheduler.breakers().state_of("recovering"),
        BreakerState::Closed
    );
}
