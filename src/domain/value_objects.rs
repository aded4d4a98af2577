//! Value Objects - Immutable domain primitives
//!
//! Everything that can appear as a path component or a cell in a store:
//! tables, columns and scalar values. All of them are totally ordered so
//! they can key ordered maps and trie nodes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A column identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Column(String);

impl Column {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A table definition.
///
/// Tables are identified by their id alone; the primary key columns are
/// carried along so that paths naming the table are self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    id: String,
    primary_key: Vec<Column>,
}

impl Table {
    /// Create a table with the given primary key columns, in key order.
    pub fn new(id: impl Into<String>, primary_key: Vec<Column>) -> Self {
        Self {
            id: id.into(),
            primary_key,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn primary_key(&self) -> &[Column] {
        &self.primary_key
    }

    /// Whether `column` is part of the primary key.
    pub fn is_key_column(&self, column: &Column) -> bool {
        self.primary_key.contains(column)
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Table {}

impl PartialOrd for Table {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Table {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Table {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A referential constraint between two tables.
///
/// Every row of `referer` whose `referer_columns` are all non-null must
/// match some row of `referent` on `referent_columns`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub referer: Table,
    pub referer_columns: Vec<Column>,
    pub referent: Table,
    pub referent_columns: Vec<Column>,
}

impl ForeignKey {
    pub fn new(
        referer: Table,
        referer_columns: Vec<Column>,
        referent: Table,
        referent_columns: Vec<Column>,
    ) -> Self {
        Self {
            referer,
            referer_columns,
            referent,
            referent_columns,
        }
    }
}

/// A comparable value: a path component or a cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Table(Table),
    Column(Column),
}

impl Value {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&Column> {
        match self {
            Self::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Table(t) => write!(f, "table:{}", t),
            Self::Column(c) => write!(f, "column:{}", c),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Self::Table(t)
    }
}

impl From<&Table> for Value {
    fn from(t: &Table) -> Self {
        Self::Table(t.clone())
    }
}

impl From<Column> for Value {
    fn from(c: Column) -> Self {
        Self::Column(c)
    }
}

impl From<&Column> for Value {
    fn from(c: &Column) -> Self {
        Self::Column(c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_identity_is_id() {
        let a = Table::new("items", vec![Column::new("id")]);
        let b = Table::new("items", vec![Column::new("other")]);
        assert_eq!(a, b);
        assert_ne!(a, Table::new("orders", vec![Column::new("id")]));
    }

    #[test]
    fn test_key_column() {
        let t = Table::new("items", vec![Column::new("id")]);
        assert!(t.is_key_column(&Column::new("id")));
        assert!(!t.is_key_column(&Column::new("name")));
    }

    #[test]
    fn test_value_ordering_within_variant() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::from("a") < Value::from("b"));
        assert!(Value::Null < Value::Bool(false));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(7i32), Value::Int(7));
        assert_eq!(Value::from("x"), Value::Text("x".to_string()));
        let t = Table::new("t", vec![]);
        assert_eq!(Value::from(&t).as_table(), Some(&t));
        assert_eq!(Value::from(Column::new("c")).as_column(), Some(&Column::new("c")));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(3).to_string(), "3");
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
