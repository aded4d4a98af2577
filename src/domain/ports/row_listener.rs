//! Row Listener Port
//!
//! Receives the row deltas of a live query subscription.

use crate::domain::value_objects::Value;

pub trait RowListener: Send {
    /// A row was inserted into, or updated within, the result set.
    fn handle_update(&mut self, row: &[Value]);

    /// A row left the result set.
    fn handle_delete(&mut self, row: &[Value]);
}
