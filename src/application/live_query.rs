//! Live Query Engine
//!
//! Keeps subscribed queries up to date as the ledger advances. Each pass
//! diffs two revisions at table granularity, re-evaluates only the matchers
//! whose tables changed, and streams their row deltas to the listeners one
//! row per `next()` call.
//!
//! New subscriptions first get a pass of their own that diffs the empty
//! snapshot against the engine's base, which delivers their initial result
//! set. After that they join the steady-state index.

use crate::application::ledger::{Lease, ListenerId, RevisionLedger};
use crate::domain::diff::{DiffEvent, RowEvent};
use crate::domain::ports::{DiffCursor, QueryCursor, RowListener, Store, StoreError};
use crate::domain::query::QueryTemplate;
use crate::domain::value_objects::{Table, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

pub type MatcherId = u64;

/// Subscription errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscribeError {
    #[error("query takes {expected} parameters, {actual} given")]
    ParameterCount { expected: usize, actual: usize },
    #[error("diff protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle to a live query. Cancelling it may happen from any thread; the
/// engine stops delivering to the matcher immediately and forgets it
/// before its next pass.
#[derive(Debug, Clone)]
pub struct QuerySubscription {
    id: MatcherId,
    cancelled: Arc<AtomicBool>,
}

impl QuerySubscription {
    pub fn id(&self) -> MatcherId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Matcher {
    listener: Box<dyn RowListener>,
    query: Arc<QueryTemplate>,
    parameters: Vec<Value>,
    cancelled: Arc<AtomicBool>,
}

impl Matcher {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Matchers interested in each table. A query is indexed under every table
/// it reads.
type TableIndex = HashMap<Table, BTreeSet<MatcherId>>;

enum Phase<S: Store> {
    /// Initial delivery to freshly subscribed matchers.
    New,
    /// Catching up from the engine's base to `head`.
    Uncached { head: Lease<S::Revision> },
}

enum Step {
    Delivered,
    Exhausted,
}

struct Pass<S: Store> {
    phase: Phase<S>,
    index: TableIndex,
    base: S::Revision,
    fork: S::Revision,
    diff: Box<dyn DiffCursor>,
    visited: HashSet<MatcherId>,
    queue: VecDeque<MatcherId>,
    current: Option<(MatcherId, Box<dyn QueryCursor>)>,
}

impl<S: Store> Pass<S> {
    fn new(
        phase: Phase<S>,
        index: TableIndex,
        base: S::Revision,
        fork: S::Revision,
        store: &S,
    ) -> Self {
        let diff = store.diff(&base, &fork, false);
        Self {
            phase,
            index,
            base,
            fork,
            diff,
            visited: HashSet::new(),
            queue: VecDeque::new(),
            current: None,
        }
    }

    /// Advance until one row is delivered or the diff is exhausted.
    fn step(
        &mut self,
        matchers: &mut HashMap<MatcherId, Matcher>,
        store: &S,
    ) -> Result<Step, SubscribeError> {
        loop {
            if let Some((id, cursor)) = self.current.as_mut() {
                let event = cursor.next_row()?;
                let Some(matcher) = matchers.get_mut(id).filter(|m| !m.is_cancelled()) else {
                    self.current = None;
                    continue;
                };
                match event {
                    RowEvent::Inserted(row) | RowEvent::Updated(row) => {
                        matcher.listener.handle_update(&row);
                        return Ok(Step::Delivered);
                    }
                    RowEvent::Deleted {
                        row,
                        updated: false,
                    } => {
                        matcher.listener.handle_delete(&row);
                        return Ok(Step::Delivered);
                    }
                    // The replacement row follows as an insert.
                    RowEvent::Deleted { updated: true, .. } => {}
                    RowEvent::End => self.current = None,
                }
                continue;
            }

            if let Some(id) = self.queue.pop_front() {
                if !self.visited.insert(id) {
                    continue;
                }
                if let Some(matcher) = matchers.get(&id).filter(|m| !m.is_cancelled()) {
                    let cursor = store.query_diff(
                        &self.base,
                        &self.fork,
                        &matcher.query,
                        &matcher.parameters,
                    )?;
                    self.current = Some((id, cursor));
                }
                continue;
            }

            match self.diff.next()? {
                DiffEvent::Key { base, fork } => {
                    self.diff.skip();
                    let table = match fork.as_ref().or(base.as_ref()) {
                        Some(Value::Table(table)) => table,
                        other => {
                            return Err(SubscribeError::Protocol(format!(
                                "expected a table key, got {:?}",
                                other
                            )))
                        }
                    };
                    if let Some(ids) = self.index.get(table) {
                        tracing::trace!(
                            "live query table changed table={} matchers={}",
                            table,
                            ids.len()
                        );
                        self.queue.extend(ids.iter().copied());
                    }
                }
                DiffEvent::End => return Ok(Step::Exhausted),
                other => {
                    return Err(SubscribeError::Protocol(format!(
                        "unexpected {:?} at table level",
                        other
                    )))
                }
            }
        }
    }
}

/// Incremental live query engine over one ledger.
///
/// Every mutating operation takes `&mut self`, so the engine is driven by
/// exactly one owner at a time.
pub struct LiveQueryEngine<S: Store> {
    ledger: Arc<RevisionLedger<S>>,
    base: Lease<S::Revision>,
    matchers: HashMap<MatcherId, Matcher>,
    pending: TableIndex,
    active: TableIndex,
    pass: Option<Pass<S>>,
    next_id: MatcherId,
    notify: Arc<Notify>,
    ledger_listener: ListenerId,
}

impl<S: Store> LiveQueryEngine<S> {
    /// Create an engine positioned at the ledger's current head.
    pub fn new(ledger: Arc<RevisionLedger<S>>) -> Self {
        let notify = Arc::new(Notify::new());
        let signal = notify.clone();
        let ledger_listener = ledger.register(Arc::new(move || signal.notify_one()));
        let base = ledger.head();
        Self {
            ledger,
            base,
            matchers: HashMap::new(),
            pending: TableIndex::new(),
            active: TableIndex::new(),
            pass: None,
            next_id: 0,
            notify,
            ledger_listener,
        }
    }

    /// Subscribe `listener` to `query` bound to `parameters`.
    pub fn subscribe(
        &mut self,
        listener: impl RowListener + 'static,
        query: Arc<QueryTemplate>,
        parameters: Vec<Value>,
    ) -> Result<QuerySubscription, SubscribeError> {
        if parameters.len() != query.parameter_count() {
            return Err(SubscribeError::ParameterCount {
                expected: query.parameter_count(),
                actual: parameters.len(),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let tables = query.source.tables();
        for table in &tables {
            self.pending.entry(table.clone()).or_default().insert(id);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.matchers.insert(
            id,
            Matcher {
                listener: Box::new(listener),
                query,
                parameters,
                cancelled: cancelled.clone(),
            },
        );
        tracing::debug!("live query subscribed matcher={} tables={}", id, tables.len());
        Ok(QuerySubscription { id, cancelled })
    }

    /// Number of live (not cancelled) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.matchers.values().filter(|m| !m.is_cancelled()).count()
    }

    /// Sequence of the last revision fully delivered.
    pub fn base_sequence(&self) -> u64 {
        self.base.sequence()
    }

    /// Deliver at most one row. Returns `false` when nothing is left to do.
    pub fn next(&mut self) -> Result<bool, SubscribeError> {
        loop {
            let Some(pass) = self.pass.as_mut() else {
                if !self.start_pass() {
                    return Ok(false);
                }
                continue;
            };
            match pass.step(&mut self.matchers, self.ledger.store().as_ref()) {
                Ok(Step::Delivered) => return Ok(true),
                Ok(Step::Exhausted) => self.finish_pass(),
                Err(e) => {
                    self.abort_pass();
                    tracing::error!("live query pass aborted: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Deliver every available row. Returns how many were delivered.
    pub fn drain(&mut self) -> Result<usize, SubscribeError> {
        let mut delivered = 0;
        while self.next()? {
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Drain whenever the ledger advances, until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SubscribeError> {
        tracing::info!("live query engine running matchers={}", self.subscription_count());
        let notify = self.notify.clone();
        loop {
            self.drain()?;
            tokio::select! {
                _ = notify.notified() => {}
                _ = shutdown.recv() => {
                    tracing::info!("live query engine stopped base_sequence={}", self.base.sequence());
                    return Ok(());
                }
            }
        }
    }

    fn start_pass(&mut self) -> bool {
        self.prune_cancelled();
        let store = self.ledger.store().clone();

        if !self.pending.is_empty() {
            let index = std::mem::take(&mut self.pending);
            let fork = self.base.snapshot().clone();
            self.pass = Some(Pass::new(Phase::New, index, store.empty(), fork, &store));
            return true;
        }

        let Some(head) = self.ledger.next(&self.base) else {
            return false;
        };
        if self.active.is_empty() {
            self.base = self.ledger.head();
            return false;
        }

        tracing::debug!(
            "live query pass from={} to={}",
            self.base.sequence(),
            head.sequence()
        );
        let base = self.base.snapshot().clone();
        let fork = head.snapshot().clone();
        self.pass = Some(Pass::new(
            Phase::Uncached { head },
            self.active.clone(),
            base,
            fork,
            &store,
        ));
        true
    }

    fn finish_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        match pass.phase {
            Phase::New => {
                for (table, ids) in pass.index {
                    self.active.entry(table).or_default().extend(ids);
                }
            }
            Phase::Uncached { head } => self.base = head,
        }
    }

    /// Drop the current pass. Matchers of an unfinished initial delivery go
    /// back to pending so the next pass starts their delivery over.
    fn abort_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        if let Phase::New = pass.phase {
            for (table, ids) in pass.index {
                self.pending.entry(table).or_default().extend(ids);
            }
        }
    }

    fn prune_cancelled(&mut self) {
        let cancelled: HashSet<MatcherId> = self
            .matchers
            .iter()
            .filter(|(_, m)| m.is_cancelled())
            .map(|(id, _)| *id)
            .collect();
        if cancelled.is_empty() {
            return;
        }
        self.matchers.retain(|id, _| !cancelled.contains(id));
        for index in [&mut self.pending, &mut self.active] {
            index.retain(|_, ids| {
                ids.retain(|id| !cancelled.contains(id));
                !ids.is_empty()
            });
        }
        tracing::debug!("live query pruned matchers={}", cancelled.len());
    }
}

impl<S: Store> Drop for LiveQueryEngine<S> {
    fn drop(&mut self) {
        self.ledger.unregister(self.ledger_listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryBuilder, MemoryRevision, MemoryStore};
    use crate::domain::diff::DuplicateKeyResolution;
    use crate::domain::ports::{
        ConflictResolver, ForeignKeyResolver, RevisionBuilder, StoreListener, Subscription,
    };
    use crate::domain::query::{Expression, Source, TableReference};
    use crate::domain::value_objects::Column;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(&'static str, Vec<Value>)>>>);

    impl Recorder {
        fn take(&self) -> Vec<(&'static str, Vec<Value>)> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl RowListener for Recorder {
        fn handle_update(&mut self, row: &[Value]) {
            self.0.lock().push(("update", row.to_vec()));
        }

        fn handle_delete(&mut self, row: &[Value]) {
            self.0.lock().push(("delete", row.to_vec()));
        }
    }

    fn items() -> Table {
        Table::new("items", vec![Column::new("id")])
    }

    fn labels() -> Table {
        Table::new("labels", vec![Column::new("id")])
    }

    fn put(store: &MemoryStore, table: &Table, id: i64, column: &str, value: &str) {
        store
            .apply(|b| {
                b.insert(
                    DuplicateKeyResolution::Overwrite,
                    &[
                        Value::from(table),
                        Value::Int(id),
                        Value::from(Column::new(column)),
                        Value::from(value),
                    ],
                )
            })
            .unwrap();
    }

    fn remove(store: &MemoryStore, table: &Table, id: i64) {
        store
            .apply(|b| b.delete(&[Value::from(table), Value::Int(id)]))
            .unwrap();
    }

    fn all_items() -> Arc<QueryTemplate> {
        let r = TableReference::new(items());
        Arc::new(QueryTemplate::new(
            vec![r.column(&Column::new("id")), r.column(&Column::new("name"))],
            r.into(),
            Expression::constant(true),
        ))
    }

    fn setup() -> (Arc<MemoryStore>, LiveQueryEngine<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = RevisionLedger::new(store.clone());
        (store, LiveQueryEngine::new(ledger))
    }

    #[test]
    fn test_initial_result_set_is_delivered() {
        let (store, mut engine) = setup();
        put(&store, &items(), 1, "name", "a");
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();

        // The engine was created before the insert; catch up first.
        engine.drain().unwrap();
        assert_eq!(
            recorder.take(),
            vec![("update", vec![Value::Int(1), Value::from("a")])]
        );
        assert!(!engine.next().unwrap());
    }

    #[test]
    fn test_insert_update_delete_stream() {
        let (store, mut engine) = setup();
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        assert_eq!(engine.drain().unwrap(), 0);

        put(&store, &items(), 1, "name", "a");
        assert!(engine.next().unwrap());
        assert!(!engine.next().unwrap());

        put(&store, &items(), 1, "name", "b");
        engine.drain().unwrap();
        remove(&store, &items(), 1);
        engine.drain().unwrap();

        assert_eq!(
            recorder.take(),
            vec![
                ("update", vec![Value::Int(1), Value::from("a")]),
                ("update", vec![Value::Int(1), Value::from("b")]),
                ("delete", vec![Value::Int(1), Value::from("b")]),
            ]
        );
    }

    #[test]
    fn test_coalesces_unpinned_revisions() {
        let (store, mut engine) = setup();
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        engine.drain().unwrap();

        put(&store, &items(), 1, "name", "a");
        put(&store, &items(), 1, "name", "b");
        put(&store, &items(), 1, "name", "c");
        engine.drain().unwrap();

        assert_eq!(
            recorder.take(),
            vec![("update", vec![Value::Int(1), Value::from("c")])]
        );
        assert_eq!(engine.base_sequence(), 4);
    }

    #[test]
    fn test_unrelated_table_changes_are_ignored() {
        let (store, mut engine) = setup();
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        engine.drain().unwrap();

        put(&store, &labels(), 1, "text", "x");
        assert_eq!(engine.drain().unwrap(), 0);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_join_delivers_once_per_pass() {
        let (store, mut engine) = setup();
        let i = TableReference::new(items());
        let l = TableReference::new(labels());
        let query = Arc::new(QueryTemplate::new(
            vec![
                i.column(&Column::new("id")),
                i.column(&Column::new("name")),
                l.column(&Column::new("text")),
            ],
            Source::join(i.clone().into(), l.clone().into()),
            Expression::equal(i.column(&Column::new("id")), l.column(&Column::new("id"))),
        ));
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), query, vec![]).unwrap();
        engine.drain().unwrap();

        store
            .apply(|b| {
                b.insert_row(&items(), &[(Column::new("id"), 1.into()), (Column::new("name"), "a".into())])?;
                b.insert_row(&labels(), &[(Column::new("id"), 1.into()), (Column::new("text"), "x".into())])
            })
            .unwrap();
        engine.drain().unwrap();

        assert_eq!(
            recorder.take(),
            vec![("update", vec![Value::Int(1), Value::from("a"), Value::from("x")])]
        );
    }

    #[test]
    fn test_parameters_bind_and_are_counted() {
        let (store, mut engine) = setup();
        let r = TableReference::new(items());
        let query = Arc::new(QueryTemplate::new(
            vec![r.column(&Column::new("name"))],
            r.clone().into(),
            Expression::equal(r.column(&Column::new("id")), Expression::parameter(0)),
        ));

        let err = engine
            .subscribe(Recorder::default(), query.clone(), vec![])
            .unwrap_err();
        assert!(matches!(
            err,
            SubscribeError::ParameterCount {
                expected: 1,
                actual: 0
            }
        ));

        let recorder = Recorder::default();
        engine
            .subscribe(recorder.clone(), query, vec![Value::Int(2)])
            .unwrap();
        put(&store, &items(), 1, "name", "a");
        put(&store, &items(), 2, "name", "b");
        engine.drain().unwrap();
        assert_eq!(recorder.take(), vec![("update", vec![Value::from("b")])]);
    }

    #[test]
    fn test_cancelled_subscription_stops_delivery() {
        let (store, mut engine) = setup();
        let recorder = Recorder::default();
        let subscription = engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        engine.drain().unwrap();

        subscription.cancel();
        put(&store, &items(), 1, "name", "a");
        assert_eq!(engine.drain().unwrap(), 0);
        assert!(recorder.take().is_empty());
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn test_late_subscriber_gets_current_state_only() {
        let (store, mut engine) = setup();
        let first = Recorder::default();
        engine.subscribe(first.clone(), all_items(), vec![]).unwrap();
        put(&store, &items(), 1, "name", "a");
        put(&store, &items(), 2, "name", "b");
        remove(&store, &items(), 1);
        engine.drain().unwrap();

        let second = Recorder::default();
        engine.subscribe(second.clone(), all_items(), vec![]).unwrap();
        engine.drain().unwrap();
        assert_eq!(
            second.take(),
            vec![("update", vec![Value::Int(2), Value::from("b")])]
        );
    }

    /// Wraps a memory store and reports a malformed structural diff while
    /// `broken` is set. Records whether any diff asked for values.
    struct DescendingStore {
        inner: MemoryStore,
        broken: AtomicBool,
        values_requested: AtomicBool,
    }

    impl DescendingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                broken: AtomicBool::new(true),
                values_requested: AtomicBool::new(false),
            }
        }
    }

    struct Malformed;

    impl DiffCursor for Malformed {
        fn next(&mut self) -> Result<DiffEvent, StoreError> {
            Ok(DiffEvent::Descend)
        }

        fn skip(&mut self) {}
    }

    impl Store for DescendingStore {
        type Revision = MemoryRevision;
        type Builder = MemoryBuilder;

        fn head(&self) -> MemoryRevision {
            self.inner.head()
        }

        fn empty(&self) -> MemoryRevision {
            self.inner.empty()
        }

        fn merge(
            &self,
            base: &MemoryRevision,
            fork: &MemoryRevision,
            conflicts: &dyn ConflictResolver,
            foreign_keys: &dyn ForeignKeyResolver,
        ) -> Result<(), StoreError> {
            self.inner.merge(base, fork, conflicts, foreign_keys)
        }

        fn diff(
            &self,
            base: &MemoryRevision,
            fork: &MemoryRevision,
            include_values: bool,
        ) -> Box<dyn DiffCursor> {
            if include_values {
                self.values_requested.store(true, Ordering::SeqCst);
            }
            if self.broken.load(Ordering::SeqCst) {
                return Box::new(Malformed);
            }
            self.inner.diff(base, fork, include_values)
        }

        fn query_diff(
            &self,
            base: &MemoryRevision,
            fork: &MemoryRevision,
            query: &QueryTemplate,
            parameters: &[Value],
        ) -> Result<Box<dyn QueryCursor>, StoreError> {
            self.inner.query_diff(base, fork, query, parameters)
        }

        fn builder(&self, revision: &MemoryRevision) -> Self::Builder {
            self.inner.builder(revision)
        }

        fn register_listener(&self, listener: StoreListener) -> Subscription {
            self.inner.register_listener(listener)
        }
    }

    #[test]
    fn test_out_of_order_diff_is_a_protocol_violation() {
        let store = Arc::new(DescendingStore::new());
        let ledger = RevisionLedger::new(store.clone());
        let mut engine = LiveQueryEngine::new(ledger);
        engine.subscribe(Recorder::default(), all_items(), vec![]).unwrap();
        assert!(matches!(engine.next(), Err(SubscribeError::Protocol(_))));
    }

    #[test]
    fn test_subscription_survives_failed_initial_delivery() {
        let store = Arc::new(DescendingStore::new());
        let ledger = RevisionLedger::new(store.clone());
        let mut engine = LiveQueryEngine::new(ledger);
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        assert!(engine.next().is_err());

        store.broken.store(false, Ordering::SeqCst);
        put(&store.inner, &items(), 1, "name", "a");
        engine.drain().unwrap();

        assert_eq!(engine.subscription_count(), 1);
        assert_eq!(
            recorder.take(),
            vec![("update", vec![Value::Int(1), Value::from("a")])]
        );
    }

    #[test]
    fn test_table_level_diff_skips_values() {
        let store = Arc::new(DescendingStore::new());
        store.broken.store(false, Ordering::SeqCst);
        let ledger = RevisionLedger::new(store.clone());
        let mut engine = LiveQueryEngine::new(ledger);
        let recorder = Recorder::default();
        engine.subscribe(recorder.clone(), all_items(), vec![]).unwrap();
        engine.drain().unwrap();

        put(&store.inner, &items(), 1, "name", "a");
        engine.drain().unwrap();

        assert_eq!(recorder.take().len(), 1);
        assert!(!store.values_requested.load(Ordering::SeqCst));
    }
}
