//! Domain Layer
//!
//! Values, queries, diff events and the ports the change-propagation
//! components consume.

pub mod diff;
pub mod ports;
pub mod query;
pub mod value_objects;

pub use diff::{DiffEvent, DuplicateKeyResolution, RowEvent};
pub use query::{ColumnReference, Expression, QueryTemplate, Source, TableReference};
pub use value_objects::{Column, ForeignKey, Table, Value};
