//! Task fixtures shared by the integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rillflow::schema::Schema;
use rillflow::task::{task_fn, FnTask, TaskError};
use serde_json::json;

use super::any_object;

/// Reads `value` (or the previous step's `result`) and doubles it.
pub fn double_as(id: &str) -> FnTask {
    task_fn(
        id,
        any_object(),
        Schema::object([("result", Schema::Integer)]),
        |input, _ctx| async move {
            let v = input["value"]
                .as_i64()
                .or_else(|| input["result"].as_i64())
                .ok_or(TaskError::MissingInput { what: "value" })?;
            Ok(json!({"result": v * 2}))
        },
    )
}

/// `{"value": n}` → `{"value": n + k}`, after an optional delay.
pub fn add_k(id: &str, k: i64, delay_ms: u64) -> FnTask {
    task_fn(
        id,
        Schema::object([("value", Schema::Integer)]),
        Schema::object([("value", Schema::Integer)]),
        move |input, _ctx| async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let v = input["value"]
                .as_i64()
                .ok_or(TaskError::MissingInput { what: "value" })?;
            Ok(json!({"value": v + k}))
        },
    )
}

/// Squares a number, sleeping first so pause requests can land mid-run.
pub fn square_slow(delay_ms: u64) -> FnTask {
    task_fn(
        "square",
        Schema::Number,
        Schema::Number,
        move |input, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let v = input.as_i64().ok_or(TaskError::MissingInput { what: "number" })?;
            Ok(json!(v * v))
        },
    )
}

/// Attaches `"tag": label` to a `{"result": n}` payload.
pub fn tag(id: &str, label: &str) -> FnTask {
    let label = label.to_string();
    task_fn(
        id,
        Schema::object([("result", Schema::Integer)]),
        Schema::object([("result", Schema::Integer), ("tag", Schema::String)]),
        move |input, _ctx| {
            let label = label.clone();
            async move {
                let v = input["result"]
                    .as_i64()
                    .ok_or(TaskError::MissingInput { what: "result" })?;
                Ok(json!({"result": v, "tag": label}))
            }
        },
    )
}

/// Fails its first `fail_times` invocations, then echoes the input.
/// The counter exposes how many times execute actually ran.
pub fn flaky(id: &str, fail_times: u32) -> (FnTask, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let task = task_fn(id, any_object(), any_object(), move |input, _ctx| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= fail_times {
                Err(TaskError::msg(format!("scripted failure #{n}")))
            } else {
                Ok(input)
            }
        }
    });
    (task, counter)
}

/// A task that always fails; the counter records invocation count.
pub fn always_fails(id: &str) -> (FnTask, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let task = task_fn(id, any_object(), any_object(), move |_input, _ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::msg("scripted failure"))
        }
    });
    (task, counter)
}

/// Echo task with a compensation that appends its id to the shared log.
pub fn compensatable(id: &str, log: Arc<Mutex<Vec<String>>>) -> FnTask {
    let id_owned = id.to_string();
    task_fn(id, any_object(), any_object(), |input, _ctx| async move {
        Ok(input)
    })
    .with_compensation(move |_output, _ctx| {
        let log = log.clone();
        let id = id_owned.clone();
        async move {
            log.lock().expect("compensation log poisoned").push(id);
            Ok(())
        }
    })
}
