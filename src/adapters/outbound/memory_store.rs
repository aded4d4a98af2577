//! In-Memory Store
//!
//! Implements the `Store` port with persistent, copy-on-write snapshots.
//! A revision is a map of tables to rows keyed by primary-key tuple; every
//! level is behind an `Arc`, so deriving a revision only copies the path
//! that changed.

use crate::adapters::outbound::memory_query::QueryDiff;
use crate::domain::diff::{DiffEvent, DuplicateKeyResolution};
use crate::domain::ports::{
    Conflict, ConflictResolver, DiffCursor, ForeignKeyAction, ForeignKeyResolver, PreferFork,
    QueryCursor, RestrictBrokenReferences, RevisionBuilder, Store, StoreError, StoreListener,
    Subscription,
};
use crate::domain::query::QueryTemplate;
use crate::domain::value_objects::{Column, ForeignKey, Table, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cells of a row, primary-key columns included.
pub type Row = BTreeMap<Column, Value>;

type Rows = BTreeMap<Vec<Value>, Arc<Row>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Tree {
    tables: BTreeMap<Table, Arc<Rows>>,
}

/// An immutable snapshot of a `MemoryStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRevision(Arc<Tree>);

impl MemoryRevision {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ {
        self.0.tables.keys()
    }

    pub(crate) fn table_rows(
        &self,
        table: &Table,
    ) -> impl Iterator<Item = (&Vec<Value>, &Arc<Row>)> + '_ {
        self.0.tables.get(table).into_iter().flat_map(|rows| rows.iter())
    }

    /// All rows of `table` in key order.
    pub fn rows(&self, table: &Table) -> Vec<Row> {
        self.table_rows(table).map(|(_, row)| row.as_ref().clone()).collect()
    }

    pub fn row(&self, table: &Table, key: &[Value]) -> Option<&Row> {
        self.0.tables.get(table)?.get(key).map(Arc::as_ref)
    }

    pub fn get(&self, table: &Table, key: &[Value], column: &Column) -> Option<&Value> {
        self.row(table, key)?.get(column)
    }

    pub fn row_count(&self, table: &Table) -> usize {
        self.0.tables.get(table).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.0.tables.is_empty()
    }
}

impl PartialEq for MemoryRevision {
    fn eq(&self, other: &Self) -> bool {
        self.same(other) || self.0 == other.0
    }
}

/// In-memory multi-version store.
pub struct MemoryStore {
    head: Mutex<MemoryRevision>,
    listeners: Arc<RwLock<Vec<(u64, StoreListener)>>>,
    next_listener: AtomicU64,
    foreign_keys: RwLock<Vec<ForeignKey>>,
    conflicts: Arc<dyn ConflictResolver>,
    broken_references: Arc<dyn ForeignKeyResolver>,
}

impl MemoryStore {
    /// Create an empty store whose `apply` lets incoming changes win and
    /// rejects broken references.
    pub fn new() -> Self {
        Self::with_resolvers(Arc::new(PreferFork), Arc::new(RestrictBrokenReferences))
    }

    /// Create an empty store with the resolvers `apply` merges with.
    pub fn with_resolvers(
        conflicts: Arc<dyn ConflictResolver>,
        broken_references: Arc<dyn ForeignKeyResolver>,
    ) -> Self {
        Self {
            head: Mutex::new(MemoryRevision::default()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener: AtomicU64::new(0),
            foreign_keys: RwLock::new(Vec::new()),
            conflicts,
            broken_references,
        }
    }

    /// Enforce `constraint` on every subsequent merge.
    pub fn add_foreign_key(&self, constraint: ForeignKey) {
        self.foreign_keys.write().push(constraint);
    }

    /// Build a revision from the current head and merge it back.
    pub fn apply<F>(&self, build: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MemoryBuilder) -> Result<(), StoreError>,
    {
        let base = self.head();
        let mut builder = self.builder(&base);
        build(&mut builder)?;
        let fork = builder.commit();
        self.merge(
            &base,
            &fork,
            self.conflicts.as_ref(),
            self.broken_references.as_ref(),
        )
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn notify(&self) {
        let listeners: Vec<StoreListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    fn enforce_foreign_keys(
        &self,
        mut tree: Tree,
        resolver: &dyn ForeignKeyResolver,
    ) -> Result<Tree, StoreError> {
        let constraints = self.foreign_keys.read().clone();
        if constraints.is_empty() {
            return Ok(tree);
        }

        // Deleting a referer may break references to it, so repeat until stable.
        loop {
            let mut deleted = false;
            for constraint in &constraints {
                for key in broken_references(&tree, constraint) {
                    match resolver.handle_broken_reference(constraint, &key) {
                        ForeignKeyAction::Restrict => {
                            return Err(StoreError::foreign_key(constraint));
                        }
                        ForeignKeyAction::Delete => {
                            tracing::debug!(
                                "deleting broken reference table={} key={:?}",
                                constraint.referer,
                                key
                            );
                            if let Some(rows) = tree.tables.get_mut(&constraint.referer) {
                                Arc::make_mut(rows).remove(&key);
                            }
                            deleted = true;
                        }
                    }
                }
            }
            tree.tables.retain(|_, rows| !rows.is_empty());
            if !deleted {
                return Ok(tree);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Revision = MemoryRevision;
    type Builder = MemoryBuilder;

    fn head(&self) -> MemoryRevision {
        self.head.lock().clone()
    }

    fn empty(&self) -> MemoryRevision {
        MemoryRevision::default()
    }

    fn merge(
        &self,
        base: &MemoryRevision,
        fork: &MemoryRevision,
        conflicts: &dyn ConflictResolver,
        foreign_keys: &dyn ForeignKeyResolver,
    ) -> Result<(), StoreError> {
        if base.same(fork) {
            return Ok(());
        }

        let changed = {
            let mut head = self.head.lock();
            let merged = if head.same(base) {
                fork.0.as_ref().clone()
            } else {
                three_way(&base.0, &head.0, &fork.0, conflicts)
            };
            let merged = self.enforce_foreign_keys(merged, foreign_keys)?;
            if merged == *head.0 {
                false
            } else {
                *head = MemoryRevision(Arc::new(merged));
                true
            }
        };

        if changed {
            tracing::trace!("memory store head moved");
            self.notify();
        }
        Ok(())
    }

    fn diff(
        &self,
        base: &MemoryRevision,
        fork: &MemoryRevision,
        include_values: bool,
    ) -> Box<dyn DiffCursor> {
        let mut events = Vec::new();
        if !base.same(fork) {
            diff_tables(&base.0, &fork.0, include_values, &mut events);
        }
        Box::new(MemoryDiff {
            events: events.into(),
        })
    }

    fn query_diff(
        &self,
        base: &MemoryRevision,
        fork: &MemoryRevision,
        query: &QueryTemplate,
        parameters: &[Value],
    ) -> Result<Box<dyn QueryCursor>, StoreError> {
        Ok(Box::new(QueryDiff::new(base, fork, query, parameters)?))
    }

    fn builder(&self, revision: &MemoryRevision) -> MemoryBuilder {
        MemoryBuilder {
            tree: revision.0.as_ref().clone(),
        }
    }

    fn register_listener(&self, listener: StoreListener) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, listener));
        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.write().retain(|(i, _)| *i != id);
            }
        })
    }
}

/// Derives a new `MemoryRevision`.
pub struct MemoryBuilder {
    tree: Tree,
}

impl MemoryBuilder {
    /// Insert a whole row given as cells; the key is taken from the
    /// table's primary-key columns.
    pub fn insert_row(&mut self, table: &Table, cells: &[(Column, Value)]) -> Result<(), StoreError> {
        let mut path = vec![Value::Table(table.clone())];
        for column in table.primary_key() {
            let value = cells
                .iter()
                .find(|(c, _)| c == column)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    StoreError::InvalidPath(format!("{} row without key column {}", table, column))
                })?;
            path.push(value);
        }
        self.insert(DuplicateKeyResolution::Overwrite, &path)?;

        for (column, value) in cells {
            if table.is_key_column(column) {
                continue;
            }
            path.push(Value::Column(column.clone()));
            path.push(value.clone());
            self.insert(DuplicateKeyResolution::Overwrite, &path)?;
            path.truncate(path.len() - 2);
        }
        Ok(())
    }

    fn rows_mut(&mut self, table: &Table) -> &mut Rows {
        Arc::make_mut(self.tree.tables.entry(table.clone()).or_default())
    }

    fn ensure_row(
        &mut self,
        table: &Table,
        key: &[Value],
        resolution: DuplicateKeyResolution,
        path: &[Value],
    ) -> Result<(), StoreError> {
        let rows = self.rows_mut(table);
        if rows.contains_key(key) {
            if resolution == DuplicateKeyResolution::Throw {
                return Err(StoreError::DuplicateKey(describe(path)));
            }
            return Ok(());
        }
        rows.insert(key.to_vec(), Arc::new(key_row(table, key)));
        Ok(())
    }

    fn set_cell(
        &mut self,
        table: &Table,
        key: &[Value],
        column: &Column,
        value: &Value,
        resolution: DuplicateKeyResolution,
        path: &[Value],
    ) -> Result<(), StoreError> {
        if let Some(index) = table.primary_key().iter().position(|c| c == column) {
            if key[index] != *value {
                return Err(StoreError::InvalidPath(describe(path)));
            }
            return self.ensure_row(table, key, DuplicateKeyResolution::Skip, path);
        }

        let rows = self.rows_mut(table);
        let row = rows
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(key_row(table, key)));
        match row.get(column) {
            Some(_) if resolution == DuplicateKeyResolution::Throw => {
                Err(StoreError::DuplicateKey(describe(path)))
            }
            Some(existing) if existing == value => Ok(()),
            Some(_) if resolution == DuplicateKeyResolution::Skip => Ok(()),
            _ => {
                Arc::make_mut(row).insert(column.clone(), value.clone());
                Ok(())
            }
        }
    }
}

impl RevisionBuilder for MemoryBuilder {
    type Revision = MemoryRevision;

    fn insert(
        &mut self,
        resolution: DuplicateKeyResolution,
        path: &[Value],
    ) -> Result<(), StoreError> {
        let (table, rest) = split_table(path)?;
        let arity = table.primary_key().len();
        if rest.len() < arity {
            return Err(StoreError::InvalidPath(describe(path)));
        }
        let (key, cell) = rest.split_at(arity);
        match cell {
            [] => self.ensure_row(table, key, resolution, path),
            [Value::Column(column), value] => {
                self.set_cell(table, key, column, value, resolution, path)
            }
            _ => Err(StoreError::InvalidPath(describe(path))),
        }
    }

    fn delete(&mut self, path: &[Value]) -> Result<(), StoreError> {
        let (table, rest) = split_table(path)?;
        let arity = table.primary_key().len();

        if rest.is_empty() {
            self.tree.tables.remove(table);
            return Ok(());
        }

        let column = match rest.len() {
            n if n <= arity => None,
            n if n == arity + 1 => Some(
                rest[arity]
                    .as_column()
                    .filter(|c| !table.is_key_column(c))
                    .ok_or_else(|| StoreError::InvalidPath(describe(path)))?,
            ),
            _ => return Err(StoreError::InvalidPath(describe(path))),
        };

        let Some(rows) = self.tree.tables.get_mut(table) else {
            return Ok(());
        };

        match column {
            Some(column) => {
                let key = &rest[..arity];
                if rows.get(key).is_some_and(|row| row.contains_key(column)) {
                    if let Some(row) = Arc::make_mut(rows).get_mut(key) {
                        Arc::make_mut(row).remove(column);
                    }
                }
            }
            None if rest.len() == arity => {
                if rows.contains_key(rest) {
                    Arc::make_mut(rows).remove(rest);
                }
            }
            None => {
                if rows.keys().any(|k| k.starts_with(rest)) {
                    Arc::make_mut(rows).retain(|k, _| !k.starts_with(rest));
                }
            }
        }

        if rows.is_empty() {
            self.tree.tables.remove(table);
        }
        Ok(())
    }

    fn commit(self) -> MemoryRevision {
        MemoryRevision(Arc::new(self.tree))
    }
}

fn split_table(path: &[Value]) -> Result<(&Table, &[Value]), StoreError> {
    match path.split_first() {
        Some((Value::Table(table), rest)) => Ok((table, rest)),
        _ => Err(StoreError::InvalidPath(describe(path))),
    }
}

fn describe(path: &[Value]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

fn key_row(table: &Table, key: &[Value]) -> Row {
    table
        .primary_key()
        .iter()
        .cloned()
        .zip(key.iter().cloned())
        .collect()
}

fn broken_references(tree: &Tree, constraint: &ForeignKey) -> Vec<Vec<Value>> {
    let Some(referers) = tree.tables.get(&constraint.referer) else {
        return Vec::new();
    };
    let referents = tree.tables.get(&constraint.referent);

    referers
        .iter()
        .filter_map(|(key, row)| {
            let values: Option<Vec<&Value>> = constraint
                .referer_columns
                .iter()
                .map(|c| row.get(c).filter(|v| !v.is_null()))
                .collect();
            let values = values?;
            let resolved = referents.is_some_and(|rows| {
                rows.values().any(|candidate| {
                    constraint
                        .referent_columns
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| candidate.get(c) == Some(*v))
                })
            });
            (!resolved).then(|| key.clone())
        })
        .collect()
}

// ==================== Merge ====================

fn three_way(base: &Tree, head: &Tree, fork: &Tree, conflicts: &dyn ConflictResolver) -> Tree {
    let mut result = head.clone();
    let empty = Rows::new();

    let tables: BTreeSet<&Table> = base.tables.keys().chain(fork.tables.keys()).collect();
    for table in tables {
        let base_rows = base.tables.get(table);
        let fork_rows = fork.tables.get(table);
        if let (Some(b), Some(f)) = (base_rows, fork_rows) {
            if Arc::ptr_eq(b, f) {
                continue;
            }
        }
        let base_rows = base_rows.map_or(&empty, Arc::as_ref);
        let fork_rows = fork_rows.map_or(&empty, Arc::as_ref);

        let keys: BTreeSet<&Vec<Value>> = base_rows.keys().chain(fork_rows.keys()).collect();
        for key in keys {
            match (base_rows.get(key), fork_rows.get(key)) {
                (Some(b), Some(f)) if Arc::ptr_eq(b, f) || b == f => {}
                (Some(_), None) => {
                    if let Some(rows) = result.tables.get_mut(table) {
                        if rows.contains_key(key) {
                            Arc::make_mut(rows).remove(key);
                        }
                    }
                }
                (base_row, Some(fork_row)) => {
                    merge_row(&mut result, table, key, base_row, fork_row, conflicts);
                }
                (None, None) => {}
            }
        }
    }

    result.tables.retain(|_, rows| !rows.is_empty());
    result
}

fn merge_row(
    result: &mut Tree,
    table: &Table,
    key: &[Value],
    base_row: Option<&Arc<Row>>,
    fork_row: &Arc<Row>,
    conflicts: &dyn ConflictResolver,
) {
    let rows = Arc::make_mut(result.tables.entry(table.clone()).or_default());
    let Some(head_row) = rows.get_mut(key) else {
        // Deleted on the head side; the delete wins over an update.
        if base_row.is_none() {
            rows.insert(key.to_vec(), fork_row.clone());
        }
        return;
    };

    let empty = Row::new();
    let base_row = base_row.map_or(&empty, Arc::as_ref);
    let columns: BTreeSet<&Column> = base_row.keys().chain(fork_row.keys()).collect();
    for column in columns {
        let base_value = base_row.get(column);
        let fork_value = fork_row.get(column);
        if base_value == fork_value {
            continue;
        }
        let head_value = head_row.get(column);
        let merged = if head_value == base_value {
            fork_value.cloned()
        } else if head_value == fork_value {
            continue;
        } else {
            conflicts.resolve(&Conflict {
                table,
                primary_key: key,
                column,
                base: base_value,
                head: head_value,
                fork: fork_value,
            })
        };
        if merged.as_ref() == head_row.get(column) {
            continue;
        }
        let row = Arc::make_mut(head_row);
        match merged {
            Some(value) => row.insert(column.clone(), value),
            None => row.remove(column),
        };
    }
}

// ==================== Structural diff ====================

struct MemoryDiff {
    events: VecDeque<DiffEvent>,
}

impl DiffCursor for MemoryDiff {
    fn next(&mut self) -> Result<DiffEvent, StoreError> {
        Ok(self.events.pop_front().unwrap_or(DiffEvent::End))
    }

    fn skip(&mut self) {
        if self.events.front() != Some(&DiffEvent::Descend) {
            return;
        }
        let mut depth = 0usize;
        while let Some(event) = self.events.pop_front() {
            match event {
                DiffEvent::Descend => depth += 1,
                DiffEvent::Ascend => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

type RowSlice<'a> = [(&'a [Value], &'a Arc<Row>)];

/// Report a key if it was added, removed, or anything below it changed.
fn emit(out: &mut Vec<DiffEvent>, base: Option<Value>, fork: Option<Value>, children: Vec<DiffEvent>) {
    if base.is_some() && fork.is_some() && children.is_empty() {
        return;
    }
    out.push(DiffEvent::Key { base, fork });
    if !children.is_empty() {
        out.push(DiffEvent::Descend);
        out.extend(children);
        out.push(DiffEvent::Ascend);
    }
}

fn diff_tables(base: &Tree, fork: &Tree, include_values: bool, out: &mut Vec<DiffEvent>) {
    let tables: BTreeSet<&Table> = base.tables.keys().chain(fork.tables.keys()).collect();
    for table in tables {
        let base_rows = base.tables.get(table);
        let fork_rows = fork.tables.get(table);
        if let (Some(b), Some(f)) = (base_rows, fork_rows) {
            if Arc::ptr_eq(b, f) {
                continue;
            }
        }
        let b = flatten(base_rows);
        let f = flatten(fork_rows);

        let mut children = Vec::new();
        diff_rows(table, 0, &b, &f, include_values, &mut children);
        let key = Value::Table(table.clone());
        emit(
            out,
            base_rows.map(|_| key.clone()),
            fork_rows.map(|_| key.clone()),
            children,
        );
    }
}

fn flatten(rows: Option<&Arc<Rows>>) -> Vec<(&[Value], &Arc<Row>)> {
    rows.map(|r| r.iter().map(|(k, v)| (k.as_slice(), v)).collect())
        .unwrap_or_default()
}

fn diff_rows(
    table: &Table,
    level: usize,
    base: &RowSlice<'_>,
    fork: &RowSlice<'_>,
    include_values: bool,
    out: &mut Vec<DiffEvent>,
) {
    if level == table.primary_key().len() {
        let base_row = base.first().map(|(_, row)| row.as_ref());
        let fork_row = fork.first().map(|(_, row)| row.as_ref());
        diff_cells(table, base_row, fork_row, include_values, out);
        return;
    }

    let (mut i, mut j) = (0, 0);
    while i < base.len() || j < fork.len() {
        let key = match (base.get(i), fork.get(j)) {
            (Some((b, _)), Some((f, _))) => b[level].clone().min(f[level].clone()),
            (Some((b, _)), None) => b[level].clone(),
            (None, Some((f, _))) => f[level].clone(),
            (None, None) => break,
        };
        let base_end = group_end(base, i, level, &key);
        let fork_end = group_end(fork, j, level, &key);

        let mut children = Vec::new();
        diff_rows(
            table,
            level + 1,
            &base[i..base_end],
            &fork[j..fork_end],
            include_values,
            &mut children,
        );
        let in_base = base_end > i;
        let in_fork = fork_end > j;
        emit(
            out,
            in_base.then(|| key.clone()),
            in_fork.then(|| key.clone()),
            children,
        );
        i = base_end;
        j = fork_end;
    }
}

fn group_end(rows: &RowSlice<'_>, start: usize, level: usize, key: &Value) -> usize {
    let mut end = start;
    while end < rows.len() && rows[end].0[level] == *key {
        end += 1;
    }
    end
}

fn diff_cells(
    table: &Table,
    base: Option<&Row>,
    fork: Option<&Row>,
    include_values: bool,
    out: &mut Vec<DiffEvent>,
) {
    let empty = Row::new();
    let base = base.unwrap_or(&empty);
    let fork = fork.unwrap_or(&empty);
    if base == fork {
        return;
    }

    let columns: BTreeSet<&Column> = base.keys().chain(fork.keys()).collect();
    for column in columns {
        if table.is_key_column(column) {
            continue;
        }
        let key = Value::Column(column.clone());
        match (base.get(column), fork.get(column)) {
            (Some(b), Some(f)) if b == f => {}
            (b, Some(f)) => {
                out.push(DiffEvent::Key {
                    base: b.map(|_| key.clone()),
                    fork: Some(key),
                });
                if include_values {
                    out.push(DiffEvent::Value(f.clone()));
                }
            }
            (Some(_), None) => out.push(DiffEvent::Key {
                base: Some(key),
                fork: None,
            }),
            (None, None) => {}
        }
    }
}
