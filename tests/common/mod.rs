#![allow(dead_code)]

pub mod tasks;

#[allow(unused_imports)]
pub use tasks::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use rillflow::runtimes::{FlowRegistry, Scheduler, SchedulerConfig};
use rillflow::schema::Schema;
use rillflow::storage::InMemoryStorage;

/// A scheduler over fresh in-memory storage, plus direct handles to both.
pub fn new_engine() -> (Arc<Scheduler>, Arc<InMemoryStorage>, Arc<FlowRegistry>) {
    new_engine_with(SchedulerConfig::default())
}

pub fn new_engine_with(
    config: SchedulerConfig,
) -> (Arc<Scheduler>, Arc<InMemoryStorage>, Arc<FlowRegistry>) {
    let storage = Arc::new(InMemoryStorage::new());
    let registry = Arc::new(FlowRegistry::new());
    let scheduler = Arc::new(Scheduler::with_config(
        registry.clone(),
        storage.clone(),
        config,
    ));
    (scheduler, storage, registry)
}

/// Object schema with no required fields (accepts any object).
pub fn any_object() -> Schema {
    Schema::object(Vec::<(String, Schema)>::new())
}

pub fn no_metadata() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::new()
}
