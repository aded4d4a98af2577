//! Propagation
//!
//! A `Listener` watches one source store. Each pass diffs the store from
//! the listener's remembered base to its current head and replays the
//! changes, under every mapping the diff touches, into that mapping's
//! target store.

use crate::domain::diff::{DiffEvent, DuplicateKeyResolution};
use crate::domain::ports::{
    ConflictResolver, DiffCursor, ForeignKeyResolver, RevisionBuilder, Store, Subscription,
    TaskDispatch,
};
use crate::domain::value_objects::Value;
use crate::replication::bridge::BridgeError;
use crate::replication::trie::{PathTrie, TrieCursor};
use crate::replication::types::MappingId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One direction of a bridge.
pub(crate) struct Mapping<S: Store> {
    pub(crate) id: MappingId,
    pub(crate) source_path: Vec<Value>,
    pub(crate) target: Arc<S>,
    pub(crate) target_path: Vec<Value>,
}

/// Resolvers and limits shared by every listener of a bridge.
#[derive(Clone)]
pub(crate) struct PassSettings {
    pub(crate) max_depth: usize,
    pub(crate) dispatch: Arc<dyn TaskDispatch>,
    pub(crate) conflicts: Arc<dyn ConflictResolver>,
    pub(crate) foreign_keys: Arc<dyn ForeignKeyResolver>,
}

struct ListenerState<S: Store> {
    trie: PathTrie,
    mappings: HashMap<MappingId, Arc<Mapping<S>>>,
    /// Revision the next pass diffs from
    base: S::Revision,
}

/// Watches one source store on behalf of all its mappings.
///
/// The state lock is held for the whole of a pass, so at most one pass
/// runs per listener. `active` and `pending` coalesce triggers that arrive
/// while a pass is running, including ones raised by the pass itself.
pub(crate) struct Listener<S: Store> {
    store: Arc<S>,
    settings: PassSettings,
    active: AtomicBool,
    pending: AtomicBool,
    state: Mutex<ListenerState<S>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<S: Store> Listener<S> {
    pub(crate) fn new(store: Arc<S>, settings: PassSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let listener = weak.clone();
            let subscription = store.register_listener(Arc::new(move || {
                if let Some(listener) = listener.upgrade() {
                    listener.trigger();
                }
            }));
            let base = store.empty();
            Self {
                store,
                settings,
                active: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                state: Mutex::new(ListenerState {
                    trie: PathTrie::new(),
                    mappings: HashMap::new(),
                    base,
                }),
                subscription: Mutex::new(Some(subscription)),
            }
        })
    }

    /// Add `mapping` and rewind the base so the next pass mirrors
    /// everything the store already holds.
    pub(crate) fn install(&self, mapping: Arc<Mapping<S>>) {
        let mut state = self.state.lock();
        state.trie.insert(&mapping.source_path, mapping.id);
        state.mappings.insert(mapping.id, mapping);
        state.base = self.store.empty();
    }

    /// Remove `mapping`. Returns `true` if no mappings remain.
    pub(crate) fn uninstall(&self, mapping: &Mapping<S>) -> bool {
        let mut state = self.state.lock();
        state.trie.remove(&mapping.source_path, mapping.id);
        state.mappings.remove(&mapping.id);
        state.trie.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().trie.is_empty()
    }

    pub(crate) fn check_pruned(&self) -> bool {
        self.state.lock().trie.check_pruned()
    }

    /// Stop listening to the store.
    pub(crate) fn cancel(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
    }

    /// Schedule a pass on the dispatcher.
    pub(crate) fn trigger(self: &Arc<Self>) {
        let listener = self.clone();
        self.settings
            .dispatch
            .dispatch(Box::new(move || listener.run()));
    }

    fn run(&self) {
        self.pending.store(true, Ordering::SeqCst);
        loop {
            if self.active.swap(true, Ordering::SeqCst) {
                return;
            }
            while self.pending.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.propagate() {
                    self.active.store(false, Ordering::SeqCst);
                    tracing::error!("bridge propagation failed: {}", e);
                    panic!("bridge propagation failed: {}", e);
                }
            }
            self.active.store(false, Ordering::SeqCst);
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn propagate(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        let head = self.store.head();
        let diff = self.store.diff(&state.base, &head, true);

        let finished = Pass::new(&state.trie, &state.mappings, &self.settings).run(diff)?;
        tracing::debug!("bridge pass complete mappings={}", finished);

        state.base = head;
        Ok(())
    }
}

/// A mapping in scope during a pass, with its target path buffer and the
/// builder collecting its changes.
struct ActiveMapping<S: Store> {
    mapping: Arc<Mapping<S>>,
    path: Vec<Option<Value>>,
    /// Slot of the key currently being visited
    depth: usize,
    base: S::Revision,
    builder: S::Builder,
}

impl<S: Store> ActiveMapping<S> {
    fn start(mapping: Arc<Mapping<S>>, max_depth: usize) -> Result<Self, BridgeError> {
        let depth = mapping
            .target_path
            .len()
            .checked_sub(1)
            .ok_or(BridgeError::EmptyPath)?;

        let mut path = vec![None; mapping.target_path.len() + max_depth + 2];
        for (slot, component) in path.iter_mut().zip(&mapping.target_path) {
            *slot = Some(component.clone());
        }

        let base = mapping.target.head();
        let builder = mapping.target.builder(&base);
        Ok(Self {
            mapping,
            path,
            depth,
            base,
            builder,
        })
    }

    fn id(&self) -> MappingId {
        self.mapping.id
    }

    fn slot(&mut self, index: usize) -> Result<&mut Option<Value>, BridgeError> {
        let len = self.path.len();
        self.path
            .get_mut(index)
            .ok_or_else(|| BridgeError::Depth(format!("slot {} outside path of {}", index, len)))
    }

    fn prefix(&self, len: usize) -> Result<Vec<Value>, BridgeError> {
        self.path
            .get(..len)
            .ok_or_else(|| BridgeError::Depth(format!("prefix {} outside path", len)))?
            .iter()
            .enumerate()
            .map(|(i, component)| {
                component
                    .clone()
                    .ok_or_else(|| BridgeError::Depth(format!("slot {} unset", i)))
            })
            .collect()
    }

    fn descend(&mut self) {
        self.depth += 1;
    }

    fn ascend(&mut self) -> Result<(), BridgeError> {
        *self.slot(self.depth)? = None;
        self.depth = self
            .depth
            .checked_sub(1)
            .ok_or_else(|| BridgeError::Depth("ascended past the target root".to_string()))?;
        Ok(())
    }

    fn set_key(&mut self, key: &Value) -> Result<(), BridgeError> {
        *self.slot(self.depth)? = Some(key.clone());
        Ok(())
    }

    /// Insert the path up to the current key. A bare table is not an
    /// insertable path.
    fn insert_key(&mut self) -> Result<(), BridgeError> {
        if self.depth == 0 {
            return Ok(());
        }
        let path = self.prefix(self.depth + 1)?;
        tracing::trace!("bridge insert key mapping={} len={}", self.id(), path.len());
        self.builder.insert(DuplicateKeyResolution::Overwrite, &path)?;
        Ok(())
    }

    fn delete_key(&mut self, key: &Value) -> Result<(), BridgeError> {
        self.set_key(key)?;
        let path = self.prefix(self.depth + 1)?;
        tracing::trace!("bridge delete mapping={} len={}", self.id(), path.len());
        self.builder.delete(&path)?;
        Ok(())
    }

    /// Delete the target path itself.
    fn delete_root(&mut self) -> Result<(), BridgeError> {
        let path = self.prefix(self.depth + 1)?;
        self.builder.delete(&path)?;
        Ok(())
    }

    fn insert_value(&mut self, value: &Value) -> Result<(), BridgeError> {
        *self.slot(self.depth + 1)? = Some(value.clone());
        let path = self.prefix(self.depth + 2)?;
        self.builder
            .insert(DuplicateKeyResolution::Overwrite, &path)?;
        Ok(())
    }

    fn finish(
        self,
        conflicts: &dyn ConflictResolver,
        foreign_keys: &dyn ForeignKeyResolver,
    ) -> Result<(), BridgeError> {
        if self.depth + 1 != self.mapping.target_path.len() {
            return Err(BridgeError::Depth(format!(
                "mapping {} finished at depth {}, expected {}",
                self.mapping.id,
                self.depth,
                self.mapping.target_path.len() - 1
            )));
        }
        let fork = self.builder.commit();
        self.mapping
            .target
            .merge(&self.base, &fork, conflicts, foreign_keys)?;
        tracing::debug!("bridge merged mapping={}", self.mapping.id);
        Ok(())
    }
}

/// Walk of one source diff.
struct Pass<'a, S: Store> {
    trie: &'a PathTrie,
    mappings: &'a HashMap<MappingId, Arc<Mapping<S>>>,
    settings: &'a PassSettings,
    depth: usize,
    /// Whether the current key has had a column, child or delete applied
    visited: bool,
    /// Trie position for each depth; `None` once the walk leaves the trie
    cursors: Vec<Option<TrieCursor>>,
    /// Mappings that became active at each depth
    scopes: Vec<Vec<MappingId>>,
    active: BTreeMap<MappingId, ActiveMapping<S>>,
    finished: usize,
}

impl<'a, S: Store> Pass<'a, S> {
    fn new(
        trie: &'a PathTrie,
        mappings: &'a HashMap<MappingId, Arc<Mapping<S>>>,
        settings: &'a PassSettings,
    ) -> Self {
        let mut cursors = vec![None; settings.max_depth + 2];
        cursors[0] = Some(TrieCursor::Root);
        Self {
            trie,
            mappings,
            settings,
            depth: 0,
            visited: true,
            cursors,
            scopes: vec![Vec::new(); settings.max_depth + 1],
            active: BTreeMap::new(),
            finished: 0,
        }
    }

    /// Returns the number of mappings merged.
    fn run(mut self, mut diff: Box<dyn DiffCursor>) -> Result<usize, BridgeError> {
        loop {
            match diff.next()? {
                DiffEvent::Descend => self.descend()?,
                DiffEvent::Ascend => self.ascend()?,
                DiffEvent::Key { base, fork } => self.key(base, fork, diff.as_mut())?,
                DiffEvent::Value(value) => {
                    self.visited = true;
                    for m in self.active.values_mut() {
                        m.insert_value(&value)?;
                    }
                }
                DiffEvent::End => {
                    self.stop(self.depth)?;
                    if self.depth != 0 || !self.active.is_empty() {
                        return Err(BridgeError::Depth(format!(
                            "diff ended at depth {} with {} mappings open",
                            self.depth,
                            self.active.len()
                        )));
                    }
                    return Ok(self.finished);
                }
            }
        }
    }

    fn descend(&mut self) -> Result<(), BridgeError> {
        self.visited = true;
        self.depth += 1;
        if self.depth > self.settings.max_depth {
            return Err(BridgeError::Depth(format!(
                "diff deeper than {}",
                self.settings.max_depth
            )));
        }
        for m in self.active.values_mut() {
            m.descend();
        }
        Ok(())
    }

    fn ascend(&mut self) -> Result<(), BridgeError> {
        self.flush()?;
        self.stop(self.depth)?;
        if let Some(cursor) = self.cursors.get_mut(self.depth + 1) {
            *cursor = None;
        }
        self.depth = self
            .depth
            .checked_sub(1)
            .ok_or_else(|| BridgeError::Protocol("ascend above the root".to_string()))?;
        for m in self.active.values_mut() {
            m.ascend()?;
        }
        Ok(())
    }

    fn key(
        &mut self,
        base: Option<Value>,
        fork: Option<Value>,
        diff: &mut dyn DiffCursor,
    ) -> Result<(), BridgeError> {
        self.flush()?;
        let depth = self.depth;
        self.stop(depth)?;

        let key = fork
            .as_ref()
            .or(base.as_ref())
            .ok_or_else(|| BridgeError::Protocol("key event without a key".to_string()))?
            .clone();

        let node = self
            .cursors
            .get(depth)
            .copied()
            .flatten()
            .and_then(|at| self.trie.child(at, &key));
        if let Some(cursor) = self.cursors.get_mut(depth + 1) {
            *cursor = node.map(TrieCursor::Node);
        }

        let mut fresh = Vec::new();
        if let Some(node) = node {
            for id in self.trie.mappings(node) {
                if let Some(mapping) = self.mappings.get(&id) {
                    fresh.push(ActiveMapping::start(mapping.clone(), self.settings.max_depth)?);
                }
            }
        }

        if self.active.is_empty() && node.is_none() {
            diff.skip();
            return Ok(());
        }

        if fork.is_some() {
            self.visited = false;
            for m in self.active.values_mut() {
                m.set_key(&key)?;
            }
        } else {
            self.visited = true;
            for m in self.active.values_mut() {
                m.delete_key(&key)?;
            }
            // Below a table only the mirrored rows go, one by one.
            let table_rooted = depth == 0;
            if !table_rooted {
                for m in &mut fresh {
                    m.delete_root()?;
                }
            }
            let descend = node.is_some_and(|n| self.trie.has_children(n))
                || (table_rooted && !fresh.is_empty());
            if !descend {
                diff.skip();
                if !table_rooted {
                    for m in fresh {
                        m.finish(
                            self.settings.conflicts.as_ref(),
                            self.settings.foreign_keys.as_ref(),
                        )?;
                        self.finished += 1;
                    }
                }
                return Ok(());
            }
        }

        for m in fresh {
            self.scopes[depth].push(m.id());
            self.active.insert(m.id(), m);
        }
        Ok(())
    }

    /// Insert the current key into every active mapping if nothing below
    /// it was visited.
    fn flush(&mut self) -> Result<(), BridgeError> {
        if !self.visited {
            self.visited = true;
            for m in self.active.values_mut() {
                m.insert_key()?;
            }
        }
        Ok(())
    }

    /// Finish every mapping that became active at `depth`.
    fn stop(&mut self, depth: usize) -> Result<(), BridgeError> {
        let Some(scope) = self.scopes.get_mut(depth) else {
            return Ok(());
        };
        for id in std::mem::take(scope) {
            if let Some(m) = self.active.remove(&id) {
                m.finish(
                    self.settings.conflicts.as_ref(),
                    self.settings.foreign_keys.as_ref(),
                )?;
                self.finished += 1;
            }
        }
        Ok(())
    }
}
