//! Compilation of pending composition calls into a typed [`Plan`].
//!
//! Compilation threads the current value shape through the sequence,
//! checking pairwise compatibility at every operator exactly as the
//! runtime will bind inputs, and assigns every node its stable dotted-path
//! id. Rejected compositions never reach the registry, so `CompileError`
//! is never observed at runtime.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::plan::{BranchArm, Node, NodeBody, Plan};
use crate::schema::Schema;
use crate::utils::canonical;

use super::builder::{FlowBuilder, PendingNode, Subflow};
use super::Flow;

/// Structural rejection of a flow composition.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("flow {flow_id} has no nodes")]
    #[diagnostic(
        code(rillflow::compile::empty_flow),
        help("Add at least one operation before compiling.")
    )]
    EmptyFlow { flow_id: String },

    #[error("type mismatch at node {node_id}: expected {expected}, found {found}")]
    #[diagnostic(
        code(rillflow::compile::type_mismatch),
        help("The previous node's output shape must be assignment-compatible with this node's input.")
    )]
    TypeMismatch {
        node_id: String,
        expected: String,
        found: String,
    },

    #[error("branch arms at node {node_id} do not unify: {left} vs {right}")]
    #[diagnostic(
        code(rillflow::compile::branch_divergence),
        help("Every arm of a branch must yield a common output shape.")
    )]
    BranchTypeDivergence {
        node_id: String,
        left: String,
        right: String,
    },

    #[error("node {node_id} has no arms")]
    #[diagnostic(code(rillflow::compile::empty_arms))]
    EmptyArms { node_id: String },

    #[error("for_each at node {node_id} requires a sequence input, found {found}")]
    #[diagnostic(code(rillflow::compile::not_a_sequence))]
    NotASequence { node_id: String, found: String },

    #[error("while body at node {node_id} must preserve its input shape: {input} -> {output}")]
    #[diagnostic(
        code(rillflow::compile::loop_type_mismatch),
        help("A while body's output feeds the next iteration, so its shape must match the input.")
    )]
    LoopTypeMismatch {
        node_id: String,
        input: String,
        output: String,
    },

    #[error("duplicate task id {task_id} in flow {flow_id}")]
    #[diagnostic(
        code(rillflow::compile::duplicate_task),
        help("Task ids must be unique within a flow.")
    )]
    DuplicateTask { flow_id: String, task_id: String },
}

impl FlowBuilder {
    /// Type-check the composition against `input_schema` and produce an
    /// immutable [`Flow`].
    pub fn compile(self, input_schema: Schema) -> Result<Flow, CompileError> {
        let flow_id = if self.id.is_empty() {
            format!("flow_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        } else {
            self.id.clone()
        };
        if self.steps.is_empty() {
            return Err(CompileError::EmptyFlow { flow_id });
        }

        let mut seen_tasks = FxHashMap::default();
        let (plan, output_schema) = compile_sequence(
            self.steps,
            input_schema.clone(),
            "",
            &flow_id,
            &mut seen_tasks,
        )?;

        let skeleton = serde_json::json!({
            "flow_id": flow_id,
            "input": input_schema.to_string(),
            "plan": plan.skeleton(),
        });
        let bytes = canonical::to_canonical_vec(&skeleton)
            .unwrap_or_else(|_| skeleton.to_string().into_bytes());
        let definition_hash = format!("{:x}", Sha256::digest(&bytes));

        let description = self
            .description
            .unwrap_or_else(|| format!("Flow {flow_id}"));
        Ok(Flow::from_parts(
            flow_id,
            description,
            self.metadata,
            input_schema,
            output_schema,
            plan,
            definition_hash,
        ))
    }
}

fn child_id(prefix: &str, index: usize) -> String {
    if prefix.is_empty() {
        index.to_string()
    } else {
        format!("{prefix}.{index}")
    }
}

fn compile_sequence(
    steps: Vec<PendingNode>,
    input: Schema,
    prefix: &str,
    flow_id: &str,
    seen_tasks: &mut FxHashMap<String, (String, String)>,
) -> Result<(Plan, Schema), CompileError> {
    let mut nodes = Vec::with_capacity(steps.len());
    let mut current = input;

    for (index, step) in steps.into_iter().enumerate() {
        let node_id = child_id(prefix, index);
        let (body, output) = compile_node(step, &current, &node_id, flow_id, seen_tasks)?;
        nodes.push(Node {
            id: node_id,
            body,
            input: current,
            output: output.clone(),
        });
        current = output;
    }

    Ok((Plan::new(nodes), current))
}

fn compile_subflow(
    subflow: Subflow,
    input: Schema,
    prefix: &str,
    flow_id: &str,
    seen_tasks: &mut FxHashMap<String, (String, String)>,
) -> Result<(Plan, Schema), CompileError> {
    match subflow {
        Subflow::Task(task) => compile_sequence(
            vec![PendingNode::Then(task)],
            input,
            prefix,
            flow_id,
            seen_tasks,
        ),
        Subflow::Sequence(builder) => {
            if builder.steps.is_empty() {
                return Err(CompileError::EmptyArms {
                    node_id: prefix.to_string(),
                });
            }
            compile_sequence(builder.steps, input, prefix, flow_id, seen_tasks)
        }
    }
}

fn compile_node(
    step: PendingNode,
    current: &Schema,
    node_id: &str,
    flow_id: &str,
    seen_tasks: &mut FxHashMap<String, (String, String)>,
) -> Result<(NodeBody, Schema), CompileError> {
    match step {
        PendingNode::Then(task) => {
            // The same task may be referenced more than once; two distinct
            // tasks must not collide on an id.
            let signature = (
                task.input_schema().to_string(),
                task.output_schema().to_string(),
            );
            match seen_tasks.get(task.id()) {
                Some(existing) if *existing != signature => {
                    return Err(CompileError::DuplicateTask {
                        flow_id: flow_id.to_string(),
                        task_id: task.id().to_string(),
                    });
                }
                _ => {
                    seen_tasks.insert(task.id().to_string(), signature);
                }
            }
            let wanted = task.input_schema();
            if !wanted.accepts(current) {
                return Err(CompileError::TypeMismatch {
                    node_id: node_id.to_string(),
                    expected: wanted.to_string(),
                    found: current.to_string(),
                });
            }
            let output = task.output_schema();
            Ok((NodeBody::Step(task), output))
        }

        PendingNode::Branch(arms) => {
            if arms.is_empty() {
                return Err(CompileError::EmptyArms {
                    node_id: node_id.to_string(),
                });
            }
            let mut compiled = Vec::with_capacity(arms.len());
            let mut unified: Option<Schema> = None;
            for (arm_index, (predicate, subflow)) in arms.into_iter().enumerate() {
                let arm_prefix = format!("{node_id}.branch.{arm_index}");
                let (body, arm_out) =
                    compile_subflow(subflow, current.clone(), &arm_prefix, flow_id, seen_tasks)?;
                unified = Some(match unified {
                    None => arm_out,
                    Some(so_far) => so_far.unify(&arm_out).ok_or_else(|| {
                        CompileError::BranchTypeDivergence {
                            node_id: node_id.to_string(),
                            left: so_far.to_string(),
                            right: arm_out.to_string(),
                        }
                    })?,
                });
                compiled.push(BranchArm { predicate, body });
            }
            // Non-empty arms guarantee a unified shape here.
            let output = unified.unwrap_or(Schema::Any);
            Ok((NodeBody::Branch(compiled), output))
        }

        PendingNode::Parallel(arms) => {
            if arms.is_empty() {
                return Err(CompileError::EmptyArms {
                    node_id: node_id.to_string(),
                });
            }
            let mut compiled = Vec::with_capacity(arms.len());
            let mut outputs = Vec::with_capacity(arms.len());
            for (arm_index, subflow) in arms.into_iter().enumerate() {
                let arm_prefix = format!("{node_id}.parallel.{arm_index}");
                let (body, arm_out) =
                    compile_subflow(subflow, current.clone(), &arm_prefix, flow_id, seen_tasks)?;
                compiled.push(body);
                outputs.push(arm_out);
            }
            Ok((NodeBody::Parallel(compiled), Schema::Tuple(outputs)))
        }

        PendingNode::While {
            predicate,
            body,
            max_iterations,
        } => {
            let body_prefix = format!("{node_id}.loop.0");
            let (plan, body_out) =
                compile_subflow(*body, current.clone(), &body_prefix, flow_id, seen_tasks)?;
            // Loop invariant: the body's output feeds its own next iteration.
            if !(current.accepts(&body_out) && body_out.accepts(current)) {
                return Err(CompileError::LoopTypeMismatch {
                    node_id: node_id.to_string(),
                    input: current.to_string(),
                    output: body_out.to_string(),
                });
            }
            Ok((
                NodeBody::While {
                    predicate,
                    body: Box::new(plan),
                    max_iterations,
                },
                current.clone(),
            ))
        }

        PendingNode::ForEach { body, concurrency } => {
            let element = current.element_shape().ok_or_else(|| {
                CompileError::NotASequence {
                    node_id: node_id.to_string(),
                    found: current.to_string(),
                }
            })?;
            let body_prefix = format!("{node_id}.each.0");
            let (plan, body_out) =
                compile_subflow(*body, element, &body_prefix, flow_id, seen_tasks)?;
            Ok((
                NodeBody::ForEach {
                    body: Box::new(plan),
                    concurrency,
                },
                Schema::array(body_out),
            ))
        }

        PendingNode::Nested(nested) => {
            let wanted = nested.input_schema();
            if !wanted.accepts(current) {
                return Err(CompileError::TypeMismatch {
                    node_id: node_id.to_string(),
                    expected: wanted.to_string(),
                    found: current.to_string(),
                });
            }
            let output = nested.output_schema().clone();
            Ok((NodeBody::Nested(nested), output))
        }
    }
}
