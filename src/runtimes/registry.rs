//! The flow registry.
//!
//! An explicit registry object mapping `flow_id` to compiled [`Flow`]s,
//! passed to whatever hosts the engine. Registration is the last gate
//! before a flow becomes startable; duplicate ids are refused, mirroring
//! the uniqueness check the compiler applies to task ids within a flow.

use std::sync::{Arc, RwLock};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::flows::Flow;
use crate::plan::NodeBody;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("flow {flow_id} is already registered")]
    #[diagnostic(
        code(rillflow::registry::duplicate_flow),
        help("Flow ids must be unique; re-register under a new id or restart the registry.")
    )]
    DuplicateFlow { flow_id: String },
}

/// Listing entry for one registered flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowInfo {
    pub flow_id: String,
    pub description: String,
    pub nodes: Vec<NodeInfo>,
}

/// Summary of one top-level node of a flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub kind: &'static str,
    /// Task id and description, for `step` nodes.
    pub task: Option<(String, String)>,
}

/// Process-wide map from flow id to compiled plan.
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<FxHashMap<String, Arc<Flow>>>,
}

impl FlowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled flow, refusing duplicates.
    pub fn register(&self, flow: Flow) -> Result<Arc<Flow>, RegistryError> {
        let mut flows = self.flows.write().expect("registry poisoned");
        if flows.contains_key(flow.id()) {
            return Err(RegistryError::DuplicateFlow {
                flow_id: flow.id().to_string(),
            });
        }
        let flow = Arc::new(flow);
        flows.insert(flow.id().to_string(), flow.clone());
        Ok(flow)
    }

    #[must_use]
    pub fn get(&self, flow_id: &str) -> Option<Arc<Flow>> {
        self.flows
            .read()
            .expect("registry poisoned")
            .get(flow_id)
            .cloned()
    }

    /// Summaries of every registered flow, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<FlowInfo> {
        let flows = self.flows.read().expect("registry poisoned");
        let mut infos: Vec<FlowInfo> = flows
            .values()
            .map(|flow| FlowInfo {
                flow_id: flow.id().to_string(),
                description: flow.description().to_string(),
                nodes: flow
                    .plan()
                    .nodes()
                    .iter()
                    .map(|node| NodeInfo {
                        node_id: node.id.clone(),
                        kind: node.body.kind_name(),
                        task: match &node.body {
                            NodeBody::Step(task) => {
                                Some((task.id().to_string(), task.description()))
                            }
                            _ => None,
                        },
                    })
                    .collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        infos
    }
}
