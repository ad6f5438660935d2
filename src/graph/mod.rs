// # Graph Collaborator Surface
//
// The engine does not own a graph store. It depends on a driver capability
// that executes parameterized read and write queries and returns rows of
// alias-to-entity bindings. `memory` provides an embedded reference driver
// used by the test suite.

use crate::common::Value;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod memory;

/// A typed, identified node in the external graph, snapshotted as a flat
/// property mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Stable identifier
    pub id: String,

    /// Type label
    pub label: String,

    /// Property name to value
    pub properties: HashMap<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Property lookup that folds absence to NULL, matching path semantics.
    pub fn property_or_null(&self, name: &str) -> Value {
        self.properties.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }
}

/// One query result row: alias name to matched entity.
pub type ResultRow = HashMap<String, Entity>;

/// Async capability over the external graph store. Sessions and their
/// lifecycle belong to the caller; the engine only borrows this handle.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Execute a parameterized query. Read queries (`MATCH .. RETURN`)
    /// yield one row per match; write queries (`MATCH .. SET`) yield the
    /// affected rows.
    async fn run(&self, query: &str, params: &HashMap<String, Value>) -> Result<Vec<ResultRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_builder() {
        let entity = Entity::new("BP_10001", "Supplier")
            .with_property("status", "Active")
            .with_property("rating", 4i64);
        assert_eq!(entity.property("status"), Some(&Value::String("Active".into())));
        assert_eq!(entity.property_or_null("missing"), Value::Null);
    }
}
