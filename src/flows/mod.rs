//! Flow definitions and the fluent composition API.
//!
//! A [`Flow`] is a compiled, registered workflow: a [`Plan`] plus identity,
//! metadata, and the declared input schema. Flows are built with
//! [`FlowBuilder`], whose terminal [`compile`](FlowBuilder::compile) runs
//! the type checks and assigns node ids.

mod builder;
mod compilation;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::plan::Plan;
use crate::schema::Schema;

pub use builder::{flow, sequence, when, FlowBuilder, Subflow};
pub use compilation::CompileError;

/// A compiled workflow definition, immutable once built.
///
/// The `definition_hash` covers the plan's structural skeleton and is
/// stored in every snapshot: resuming an execution against a flow whose
/// composition changed (including swapped predicates, which change node
/// positions) is refused.
#[derive(Clone, Debug)]
pub struct Flow {
    id: String,
    description: String,
    metadata: BTreeMap<String, Value>,
    input_schema: Schema,
    output_schema: Schema,
    plan: Plan,
    definition_hash: String,
}

impl Flow {
    pub(crate) fn from_parts(
        id: String,
        description: String,
        metadata: BTreeMap<String, Value>,
        input_schema: Schema,
        output_schema: Schema,
        plan: Plan,
        definition_hash: String,
    ) -> Self {
        Self {
            id,
            description,
            metadata,
            input_schema,
            output_schema,
            plan,
            definition_hash,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    #[must_use]
    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    #[must_use]
    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    #[must_use]
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    #[must_use]
    pub fn definition_hash(&self) -> &str {
        &self.definition_hash
    }
}
