//! Merge Resolver Ports
//!
//! Policies injected into a merge: what to do when both sides changed a
//! cell, and what to do with rows whose foreign key no longer resolves.

use crate::domain::value_objects::{Column, ForeignKey, Table, Value};

/// A cell changed on both sides of a merge.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    pub table: &'a Table,
    pub primary_key: &'a [Value],
    pub column: &'a Column,
    pub base: Option<&'a Value>,
    pub head: Option<&'a Value>,
    pub fork: Option<&'a Value>,
}

/// Decides the merged value of a conflicting cell; `None` leaves it unset.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict<'_>) -> Option<Value>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict<'_>) -> Option<Value> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict<'_>) -> Option<Value> {
        self(conflict)
    }
}

/// The incoming change wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferFork;

impl ConflictResolver for PreferFork {
    fn resolve(&self, conflict: &Conflict<'_>) -> Option<Value> {
        conflict.fork.cloned()
    }
}

/// The current head wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferHead;

impl ConflictResolver for PreferHead {
    fn resolve(&self, conflict: &Conflict<'_>) -> Option<Value> {
        conflict.head.cloned()
    }
}

/// What to do with a row whose reference is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    /// Reject the merge.
    Restrict,
    /// Delete the referring row.
    Delete,
}

pub trait ForeignKeyResolver: Send + Sync {
    fn handle_broken_reference(
        &self,
        constraint: &ForeignKey,
        referer_key: &[Value],
    ) -> ForeignKeyAction;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestrictBrokenReferences;

impl ForeignKeyResolver for RestrictBrokenReferences {
    fn handle_broken_reference(&self, _: &ForeignKey, _: &[Value]) -> ForeignKeyAction {
        ForeignKeyAction::Restrict
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteBrokenReferences;

impl ForeignKeyResolver for DeleteBrokenReferences {
    fn handle_broken_reference(&self, _: &ForeignKey, _: &[Value]) -> ForeignKeyAction {
        ForeignKeyAction::Delete
    }
}
