//! Fluent-compiler checks: typing, node ids, and plan queries.

mod common;

use std::sync::Arc;

use common::*;
use rillflow::flows::{flow, sequence, when, CompileError, Subflow};
use rillflow::schema::Schema;
use rillflow::task::task_fn;
use serde_json::json;

fn echo(id: &str, input: Schema, output: Schema) -> rillflow::FnTask {
    task_fn(id, input, output, |input, _ctx| async move { Ok(input) })
}

#[test]
fn empty_flow_is_rejected() {
    let err = flow("nothing").compile(Schema::Any).unwrap_err();
    assert!(matches!(err, CompileError::EmptyFlow { .. }));
}

#[test]
fn then_requires_compatible_shapes() {
    let err = flow("mismatched")
        .then(echo("produce", any_object(), Schema::object([("value", Schema::Integer)])))
        .then(echo("consume", Schema::String, Schema::String))
        .compile(any_object())
        .unwrap_err();
    match err {
        CompileError::TypeMismatch { node_id, .. } => assert_eq!(node_id, "1"),
        other => panic!("expected type mismatch, got {other:?}"),
    }
}

#[test]
fn branch_arms_must_unify() {
    let err = flow("diverging")
        .branch(vec![
            (when(|_| true), Subflow::step(echo("a", Schema::Any, Schema::Bool))),
            (
                when(|_| false),
                Subflow::step(echo("b", Schema::Any, Schema::String)),
            ),
        ])
        .compile(Schema::Any)
        .unwrap_err();
    assert!(matches!(err, CompileError::BranchTypeDivergence { .. }));
}

#[test]
fn while_body_must_preserve_its_shape() {
    let err = flow("shape_shifter")
        .while_(
            when(|v| v["n"].as_i64().unwrap_or(0) > 0),
            echo(
                "morph",
                Schema::object([("n", Schema::Integer)]),
                Schema::String,
            ),
        )
        .compile(Schema::object([("n", Schema::Integer)]))
        .unwrap_err();
    assert!(matches!(err, CompileError::LoopTypeMismatch { .. }));
}

#[test]
fn for_each_requires_a_sequence() {
    let err = flow("not_a_list")
        .for_each(echo("item", Schema::Any, Schema::Any))
        .compile(Schema::String)
        .unwrap_err();
    assert!(matches!(err, CompileError::NotASequence { .. }));
}

#[test]
fn distinct_tasks_may_not_share_an_id() {
    let err = flow("colliding")
        .then(echo("worker", Schema::Any, Schema::Any))
        .then(echo("worker", Schema::Any, Schema::String))
        .compile(Schema::Any)
        .unwrap_err();
    assert!(matches!(err, CompileError::DuplicateTask { .. }));
}

#[test]
fn the_same_task_may_be_referenced_twice() {
    let compiled = flow("doubling")
        .then(double_as("double"))
        .then(double_as("double"))
        .compile(any_object());
    assert!(compiled.is_ok());
}

#[test]
fn node_ids_are_dotted_paths_from_the_root() {
    let compiled = flow("pathy")
        .then(double_as("double"))
        .branch(vec![
            (
                when(|v| v["result"].as_i64().unwrap_or(0) > 10),
                Subflow::from(
                    sequence()
                        .then(tag("tag_high", "high"))
                        .then(echo("after_high", Schema::Any, Schema::Any)),
                ),
            ),
            (when(|_| true), Subflow::step(tag("tag_low", "low"))),
        ])
        .compile(any_object())
        .unwrap();

    let plan = compiled.plan();
    assert_eq!(plan.root_nodes(), vec!["0", "1"]);
    assert!(plan.node_by_id("1.branch.0.1").is_some());
    assert!(plan.node_by_id("1.branch.1.0").is_some());
    assert!(plan.node_by_id("1.branch.2.0").is_none());
    assert_eq!(plan.successor_of("0").map(|n| n.id.as_str()), Some("1"));
    assert_eq!(
        plan.successor_of("1.branch.0.0").map(|n| n.id.as_str()),
        Some("1.branch.0.1")
    );
    assert_eq!(plan.arms_of("1").map(|arms| arms.len()), Some(2));
    assert!(plan.input_type_at("1.branch.1.0").is_some());
}

#[test]
fn parallel_output_is_a_fixed_length_tuple() {
    let compiled = flow("tupled")
        .parallel(vec![
            Subflow::step(echo("left", Schema::Any, Schema::Integer)),
            Subflow::step(echo("right", Schema::Any, Schema::String)),
        ])
        .compile(Schema::Any)
        .unwrap();
    assert_eq!(
        *compiled.output_schema(),
        Schema::Tuple(vec![Schema::Integer, Schema::String])
    );
}

#[test]
fn nested_flow_input_is_checked() {
    let child = Arc::new(
        flow("child")
            .then(echo("inner", Schema::object([("n", Schema::Integer)]), Schema::Any))
            .compile(Schema::object([("n", Schema::Integer)]))
            .unwrap(),
    );
    let err = flow("parent")
        .then(echo("stringify", Schema::Any, Schema::String))
        .nested(child)
        .compile(Schema::Any)
        .unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }));
}

#[test]
fn definition_hash_tracks_composition_changes() {
    let base = flow("hashed")
        .then(double_as("double"))
        .compile(any_object())
        .unwrap();
    let same = flow("hashed")
        .then(double_as("double"))
        .compile(any_object())
        .unwrap();
    let different = flow("hashed")
        .then(double_as("double"))
        .then(tag("tag_low", "low"))
        .compile(any_object())
        .unwrap();

    assert_eq!(base.definition_hash(), same.definition_hash());
    assert_ne!(base.definition_hash(), different.definition_hash());
}

#[test]
fn flow_metadata_round_trips() {
    let compiled = flow("labelled")
        .description("has labels")
        .metadata("tenant", json!("acme"))
        .then(double_as("double"))
        .compile(any_object())
        .unwrap();
    assert_eq!(compiled.description(), "has labels");
    assert_eq!(compiled.metadata()["tenant"], json!("acme"));
}
