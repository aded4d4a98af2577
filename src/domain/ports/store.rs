//! Store Port
//!
//! The multi-version store the change-propagation components sit on.
//! Revisions are immutable snapshots; builders derive new ones; merges
//! move the head; listeners hear about head changes.

use crate::domain::diff::{DiffEvent, DuplicateKeyResolution, RowEvent};
use crate::domain::ports::resolvers::{ConflictResolver, ForeignKeyResolver};
use crate::domain::query::QueryTemplate;
use crate::domain::value_objects::{ForeignKey, Value};
use std::fmt;
use std::sync::Arc;

/// Callback invoked after the store's head changes.
pub type StoreListener = Arc<dyn Fn() + Send + Sync>;

/// Errors raised by a store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("duplicate key at {0}")]
    DuplicateKey(String),
    #[error("broken reference from {referer} to {referent}")]
    ForeignKeyViolation { referer: String, referent: String },
    #[error("query error: {0}")]
    Query(String),
}

impl StoreError {
    pub(crate) fn foreign_key(constraint: &ForeignKey) -> Self {
        Self::ForeignKeyViolation {
            referer: constraint.referer.id().to_string(),
            referent: constraint.referent.id().to_string(),
        }
    }
}

/// Structural diff between two revisions.
pub trait DiffCursor: Send {
    /// Next event; `End` once exhausted, and forever after.
    fn next(&mut self) -> Result<DiffEvent, StoreError>;

    /// Skip the subtree of the key just returned by `next`.
    fn skip(&mut self);
}

/// Row-level diff of a query between two revisions.
pub trait QueryCursor: Send {
    fn next_row(&mut self) -> Result<RowEvent, StoreError>;
}

/// Derives a new revision from an existing one.
pub trait RevisionBuilder: Send {
    type Revision;

    /// Insert `path`: a row (`[table, pk..]`) or a cell
    /// (`[table, pk.., column, value]`).
    fn insert(
        &mut self,
        resolution: DuplicateKeyResolution,
        path: &[Value],
    ) -> Result<(), StoreError>;

    /// Delete everything under `path`.
    fn delete(&mut self, path: &[Value]) -> Result<(), StoreError>;

    fn commit(self) -> Self::Revision;
}

/// A multi-version store.
pub trait Store: Send + Sync + 'static {
    type Revision: Clone + Send + Sync + 'static;
    type Builder: RevisionBuilder<Revision = Self::Revision>;

    fn head(&self) -> Self::Revision;

    /// The revision with no data.
    fn empty(&self) -> Self::Revision;

    /// Apply the changes between `base` and `fork` to the current head.
    fn merge(
        &self,
        base: &Self::Revision,
        fork: &Self::Revision,
        conflicts: &dyn ConflictResolver,
        foreign_keys: &dyn ForeignKeyResolver,
    ) -> Result<(), StoreError>;

    fn diff(
        &self,
        base: &Self::Revision,
        fork: &Self::Revision,
        include_values: bool,
    ) -> Box<dyn DiffCursor>;

    fn query_diff(
        &self,
        base: &Self::Revision,
        fork: &Self::Revision,
        query: &QueryTemplate,
        parameters: &[Value],
    ) -> Result<Box<dyn QueryCursor>, StoreError>;

    fn builder(&self, revision: &Self::Revision) -> Self::Builder;

    /// Register a head-change listener. It is not called on registration.
    fn register_listener(&self, listener: StoreListener) -> Subscription;
}

/// Handle to a registration; `cancel` removes it.
#[must_use = "a subscription stays registered until cancelled"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cancel_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
