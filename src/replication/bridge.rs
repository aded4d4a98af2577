//! Replication Bridge
//!
//! Mirrors a region of one store into a region of another, in both
//! directions. Each registration installs two one-way mappings; every
//! source store gets one `Listener` holding the path trie for all mappings
//! that read from it.

use crate::domain::ports::{
    ConflictResolver, ForeignKeyResolver, PreferFork, RestrictBrokenReferences, Store, StoreError,
    Subscription, TaskDispatch,
};
use crate::infrastructure::{DirectDispatch, WorkerDispatch};
use crate::replication::config::{BridgeConfig, ConfigError, DispatchMode};
use crate::replication::sync::{Listener, Mapping, PassSettings};
use crate::replication::types::{MappingId, Path};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Errors raised by the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("path has {depth} components, more than the maximum of {max}")]
    PathTooDeep { depth: usize, max: usize },
    #[error("mapping path is empty")]
    EmptyPath,
    #[error("depth bookkeeping failed: {0}")]
    Depth(String),
    #[error("diff protocol violation: {0}")]
    Protocol(String),
    #[error("dispatcher failed to start: {0}")]
    Dispatch(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Keeps registered store regions in sync.
///
/// Dropping the bridge stops every listener; subscriptions outliving it
/// become no-ops.
pub struct ReplicationBridge<S: Store> {
    inner: Arc<BridgeInner<S>>,
}

struct BridgeInner<S: Store> {
    config: BridgeConfig,
    settings: PassSettings,
    /// Listeners keyed by source store address
    listeners: DashMap<usize, Arc<Listener<S>>>,
    next_mapping: AtomicU64,
}

fn store_key<S>(store: &Arc<S>) -> usize {
    Arc::as_ptr(store) as *const () as usize
}

impl<S: Store> ReplicationBridge<S> {
    /// Create a bridge whose merges let the incoming change win and
    /// restrict broken references.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let dispatch: Arc<dyn TaskDispatch> = match config.dispatch {
            DispatchMode::Direct => Arc::new(DirectDispatch),
            DispatchMode::Worker => Arc::new(
                WorkerDispatch::spawn(config.worker_name.clone())
                    .map_err(|e| BridgeError::Dispatch(e.to_string()))?,
            ),
        };
        Self::with_parts(
            config,
            dispatch,
            Arc::new(PreferFork),
            Arc::new(RestrictBrokenReferences),
        )
    }

    /// Create a bridge with an explicit dispatcher and merge resolvers.
    /// `config.dispatch` is ignored.
    pub fn with_parts(
        config: BridgeConfig,
        dispatch: Arc<dyn TaskDispatch>,
        conflicts: Arc<dyn ConflictResolver>,
        foreign_keys: Arc<dyn ForeignKeyResolver>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let settings = PassSettings {
            max_depth: config.max_depth,
            dispatch,
            conflicts,
            foreign_keys,
        };
        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                settings,
                listeners: DashMap::new(),
                next_mapping: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Mirror `left_path` in `left` with `right_path` in `right`.
    ///
    /// Existing data on either side is copied across straight away. The
    /// returned subscription removes both directions when cancelled.
    pub fn register(
        &self,
        left: &Arc<S>,
        left_path: Path,
        right: &Arc<S>,
        right_path: Path,
    ) -> Result<Subscription, BridgeError> {
        let max = self.inner.config.max_depth;
        for path in [&left_path, &right_path] {
            if path.depth() > max {
                return Err(BridgeError::PathTooDeep {
                    depth: path.depth(),
                    max,
                });
            }
        }

        let forward = Arc::new(Mapping {
            id: self.inner.next_id(),
            source_path: left_path.components(),
            target: right.clone(),
            target_path: right_path.components(),
        });
        let backward = Arc::new(Mapping {
            id: self.inner.next_id(),
            source_path: right_path.components(),
            target: left.clone(),
            target_path: left_path.components(),
        });

        let left_listener = self.inner.install(left, forward.clone());
        let right_listener = self.inner.install(right, backward.clone());

        tracing::info!(
            "bridge registered left={} right={} mappings={},{}",
            left_path,
            right_path,
            forward.id,
            backward.id
        );

        left_listener.trigger();
        right_listener.trigger();

        let inner: Weak<BridgeInner<S>> = Arc::downgrade(&self.inner);
        let (left_key, right_key) = (store_key(left), store_key(right));
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unregister(&forward, left_key);
                inner.unregister(&backward, right_key);
                tracing::info!("bridge unregistered left={} right={}", left_path, right_path);
            }
        }))
    }

    /// Run a pass on every listener.
    pub fn propagate_all(&self) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            listener.trigger();
        }
    }

    /// Number of source stores being watched.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Whether every listener's trie is free of empty nodes.
    pub fn check_pruned(&self) -> bool {
        self.inner
            .listeners
            .iter()
            .all(|entry| entry.value().check_pruned())
    }
}

impl<S: Store> BridgeInner<S> {
    fn next_id(&self) -> MappingId {
        self.next_mapping.fetch_add(1, Ordering::Relaxed)
    }

    /// Install `mapping` on the listener for `store`, creating it if needed.
    /// The map entry stays locked until the mapping is in place, so a
    /// concurrent `unregister` cannot retire the listener in between.
    fn install(&self, store: &Arc<S>, mapping: Arc<Mapping<S>>) -> Arc<Listener<S>> {
        let listener = self
            .listeners
            .entry(store_key(store))
            .or_insert_with(|| Listener::new(store.clone(), self.settings.clone()));
        listener.install(mapping);
        listener.clone()
    }

    fn unregister(&self, mapping: &Mapping<S>, source: usize) {
        let listener = match self.listeners.entry(source) {
            Entry::Occupied(entry) => {
                if !entry.get().uninstall(mapping) {
                    return;
                }
                entry.remove()
            }
            Entry::Vacant(_) => return,
        };
        listener.cancel();
        tracing::debug!("bridge listener removed mappings=0");
    }
}

impl<S: Store> Drop for BridgeInner<S> {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            entry.value().cancel();
        }
    }
}
