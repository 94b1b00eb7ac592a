//! The compiled, immutable graph model.
//!
//! A [`Plan`] is an ordered sequence of [`Node`]s produced by the fluent
//! compiler. Each node carries a stable dotted-path `node_id` assigned at
//! compile time (`"0"`, `"1.branch.0.2"`, …) so snapshots remain portable
//! across restarts, plus the input/output [`Schema`] the compiler derived
//! for that position. Loops are single `While`/`ForEach` nodes, never back
//! edges, so the graph is acyclic by construction.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::flows::Flow;
use crate::schema::Schema;
use crate::task::Task;

/// Pure predicate over the current value, used by `branch` and `while_`.
/// Predicates are registered alongside the plan and never serialized;
/// persisted executions reference them by compiled node position.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One arm of a `branch` node.
#[derive(Clone)]
pub struct BranchArm {
    pub predicate: Predicate,
    pub body: Plan,
}

/// The operator at a plan position.
#[derive(Clone)]
pub enum NodeBody {
    /// Execute one task.
    Step(Arc<dyn Task>),
    /// First arm whose predicate matches the current value runs.
    Branch(Vec<BranchArm>),
    /// Every sub-plan runs on the same input; output is the ordered list
    /// of arm outputs in declared order.
    Parallel(Vec<Plan>),
    /// Re-executes `body` while the predicate holds on the current value.
    While {
        predicate: Predicate,
        body: Box<Plan>,
        max_iterations: u32,
    },
    /// Runs `body` once per element of the current sequence.
    ForEach { body: Box<Plan>, concurrency: usize },
    /// A child flow treated as an opaque node; executed as a linked
    /// sub-execution with its own execution id.
    Nested(Arc<Flow>),
}

impl NodeBody {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeBody::Step(_) => "step",
            NodeBody::Branch(_) => "branch",
            NodeBody::Parallel(_) => "parallel",
            NodeBody::While { .. } => "while",
            NodeBody::ForEach { .. } => "for_each",
            NodeBody::Nested(_) => "nested",
        }
    }
}

/// A position in a compiled plan.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub body: NodeBody,
    /// Shape of the value bound to this node's input.
    pub input: Schema,
    /// Shape of the value this node yields.
    pub output: Schema,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.body.kind_name())
            .field("input", &self.input.to_string())
            .field("output", &self.output.to_string())
            .finish()
    }
}

/// An immutable, compiled sequence of nodes.
///
/// The compiler guarantees that the output shape of node *i* is
/// assignment-compatible with the input shape of node *i+1*.
#[derive(Clone, Default)]
pub struct Plan {
    nodes: Vec<Node>,
}

impl Plan {
    pub(crate) fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The top-level sequence, in execution order.
    #[must_use]
    pub fn root_nodes(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// Resolve a node anywhere in the plan by its compile-time id.
    #[must_use]
    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        fn search<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
            for node in nodes {
                if node.id == id {
                    return Some(node);
                }
                // Only descend into nodes whose path prefixes the target.
                if !id.starts_with(&format!("{}.", node.id)) {
                    continue;
                }
                let found = match &node.body {
                    NodeBody::Branch(arms) => arms
                        .iter()
                        .find_map(|arm| search(&arm.body.nodes, id)),
                    NodeBody::Parallel(arms) => {
                        arms.iter().find_map(|arm| search(&arm.nodes, id))
                    }
                    NodeBody::While { body, .. } | NodeBody::ForEach { body, .. } => {
                        search(&body.nodes, id)
                    }
                    NodeBody::Step(_) | NodeBody::Nested(_) => None,
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        search(&self.nodes, id)
    }

    /// The node that follows `id` within its own sequence, if any.
    #[must_use]
    pub fn successor_of(&self, id: &str) -> Option<&Node> {
        fn search<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
            if let Some(pos) = nodes.iter().position(|n| n.id == id) {
                return nodes.get(pos + 1);
            }
            for node in nodes {
                if !id.starts_with(&format!("{}.", node.id)) {
                    continue;
                }
                let found = match &node.body {
                    NodeBody::Branch(arms) => {
                        arms.iter().find_map(|arm| search(&arm.body.nodes, id))
                    }
                    NodeBody::Parallel(arms) => {
                        arms.iter().find_map(|arm| search(&arm.nodes, id))
                    }
                    NodeBody::While { body, .. } | NodeBody::ForEach { body, .. } => {
                        search(&body.nodes, id)
                    }
                    NodeBody::Step(_) | NodeBody::Nested(_) => None,
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        search(&self.nodes, id)
    }

    /// Arm sub-plans of a `branch`/`parallel` node, or the single body of a
    /// `while`/`for_each` node.
    #[must_use]
    pub fn arms_of(&self, id: &str) -> Option<Vec<&Plan>> {
        match &self.node_by_id(id)?.body {
            NodeBody::Branch(arms) => Some(arms.iter().map(|a| &a.body).collect()),
            NodeBody::Parallel(arms) => Some(arms.iter().collect()),
            NodeBody::While { body, .. } | NodeBody::ForEach { body, .. } => {
                Some(vec![body.as_ref()])
            }
            NodeBody::Step(_) | NodeBody::Nested(_) => None,
        }
    }

    #[must_use]
    pub fn input_type_at(&self, id: &str) -> Option<Schema> {
        self.node_by_id(id).map(|n| n.input.clone())
    }

    #[must_use]
    pub fn output_type_at(&self, id: &str) -> Option<Schema> {
        self.node_by_id(id).map(|n| n.output.clone())
    }

    /// Structural skeleton used for the flow-definition hash: node ids,
    /// operator kinds, task ids, and derived shapes. Predicate identity is
    /// deliberately not representable, which is exactly why a re-registered
    /// flow with different composition hashes differently.
    pub(crate) fn skeleton(&self) -> Value {
        fn node_skeleton(node: &Node) -> Value {
            let detail = match &node.body {
                NodeBody::Step(task) => json!({"task": task.id()}),
                NodeBody::Branch(arms) => json!({
                    "arms": arms.iter().map(|a| a.body.skeleton()).collect::<Vec<_>>()
                }),
                NodeBody::Parallel(arms) => json!({
                    "arms": arms.iter().map(Plan::skeleton).collect::<Vec<_>>()
                }),
                NodeBody::While {
                    body,
                    max_iterations,
                    ..
                } => json!({"body": body.skeleton(), "max_iterations": max_iterations}),
                NodeBody::ForEach { body, concurrency } => {
                    json!({"body": body.skeleton(), "concurrency": concurrency})
                }
                NodeBody::Nested(flow) => json!({"flow": flow.id(), "hash": flow.definition_hash()}),
            };
            json!({
                "id": node.id,
                "kind": node.body.kind_name(),
                "input": node.input.to_string(),
                "output": node.output.to_string(),
                "detail": detail,
            })
        }
        Value::Array(self.nodes.iter().map(node_skeleton).collect())
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes.iter()).finish()
    }
}
