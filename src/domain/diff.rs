//! Diff Events
//!
//! The event vocabulary stores use to describe the difference between two
//! revisions, both structurally (a depth-first walk of the path tree) and
//! as query rows.

use crate::domain::value_objects::Value;

/// One step of a depth-first walk over the path tree
/// `table -> primary key components -> column -> value`.
///
/// A `Key` names the component at the current depth as it appears in the
/// base and the fork; `fork: None` means the key was removed. `Descend`
/// enters the subtree of the last key, `Ascend` leaves it. A `Value`
/// follows its column `Key` at the same depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
    Descend,
    Ascend,
    Key {
        base: Option<Value>,
        fork: Option<Value>,
    },
    Value(Value),
    End,
}

impl DiffEvent {
    pub fn key(base: Option<Value>, fork: Option<Value>) -> Self {
        Self::Key { base, fork }
    }
}

/// A row-level change in the result of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEvent {
    Inserted(Vec<Value>),
    Updated(Vec<Value>),
    /// `updated` is set when the row is reinserted with a new projection
    /// later in the same diff; such a row did not really disappear.
    Deleted { row: Vec<Value>, updated: bool },
    End,
}

/// What a builder does when inserting a path that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKeyResolution {
    Skip,
    Overwrite,
    Throw,
}
