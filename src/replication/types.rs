//! Replication Types
//!
//! Identifiers for nodes and mappings, and the paths that anchor a mapping
//! in a store.

use crate::domain::value_objects::{Table, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier for a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node within one running instance, written `instance:node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub instance: Uuid,
    pub node: NodeId,
}

impl NodeKey {
    pub fn new(instance: Uuid, node: NodeId) -> Self {
        Self { instance, node }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed node key: {0}")]
pub struct NodeKeyError(String);

impl FromStr for NodeKey {
    type Err = NodeKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (instance, node) = s.split_once(':').ok_or_else(|| NodeKeyError(s.to_string()))?;
        let instance = Uuid::parse_str(instance).map_err(|_| NodeKeyError(s.to_string()))?;
        Ok(Self::new(instance, NodeId::new(node)))
    }
}

/// Identifies one direction of a registered bridge.
pub type MappingId = u64;

/// A table, optionally narrowed to the rows under a primary-key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    table: Table,
    key: Vec<Value>,
}

impl Path {
    /// Every row of `table`.
    pub fn table(table: Table) -> Self {
        Self {
            table,
            key: Vec::new(),
        }
    }

    /// The rows of `table` whose primary key starts with `key`.
    pub fn new(table: Table, key: Vec<Value>) -> Self {
        Self { table, key }
    }

    pub fn table_ref(&self) -> &Table {
        &self.table
    }

    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// Number of components, counting the table.
    pub fn depth(&self) -> usize {
        self.key.len() + 1
    }

    /// The path as store components: the table followed by the key.
    pub fn components(&self) -> Vec<Value> {
        std::iter::once(Value::from(&self.table))
            .chain(self.key.iter().cloned())
            .collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table.id())?;
        for component in &self.key {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}
