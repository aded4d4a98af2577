//! Integration tests for the Replication Bridge
//!
//! Tests mirroring between independent in-memory stores through the public
//! bridge API, in direct and worker dispatch.

use parking_lot::Mutex;
use revflow::adapters::MemoryStore;
use revflow::domain::ports::{
    PreferFork, RestrictBrokenReferences, RevisionBuilder, Store, Task, TaskDispatch,
};
use revflow::domain::{Column, Table, Value};
use revflow::infrastructure::WorkerDispatch;
use revflow::replication::{BridgeConfig, Path, ReplicationBridge};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Holds passes until the test runs them.
#[derive(Default)]
struct QueuedDispatch {
    tasks: Mutex<Vec<Task>>,
}

impl QueuedDispatch {
    /// Run queued passes, including ones they queue, until none remain.
    fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return ran;
            }
            for task in tasks {
                task();
                ran += 1;
            }
        }
    }
}

impl TaskDispatch for QueuedDispatch {
    fn dispatch(&self, task: Task) {
        self.tasks.lock().push(task);
    }
}

fn table(name: &str) -> Table {
    Table::new(name, vec![Column::new("id")])
}

fn lines() -> Table {
    Table::new("lines", vec![Column::new("order"), Column::new("n")])
}

fn put(store: &MemoryStore, table: &Table, id: i64, column: &str, value: impl Into<Value>) {
    let value = value.into();
    store
        .apply(|b| {
            b.insert_row(
                table,
                &[(Column::new("id"), Value::Int(id)), (Column::new(column), value)],
            )
        })
        .unwrap();
}

fn get(store: &MemoryStore, table: &Table, key: &[Value], column: &str) -> Option<Value> {
    store.head().get(table, key, &Column::new(column)).cloned()
}

fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
}

/// Test that rows written on either side end up identical on both
#[test]
fn test_table_mapping_converges() {
    let (a, b) = stores();
    let (left, right) = (table("left"), table("right"));
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(left.clone()), &b, Path::table(right.clone()))
        .unwrap();

    put(&a, &left, 1, "name", "one");
    put(&b, &right, 2, "name", "two");
    put(&a, &left, 2, "name", "deux");

    assert_eq!(a.head().row_count(&left), 2);
    assert_eq!(b.head().row_count(&right), 2);
    assert_eq!(a.head().rows(&left), b.head().rows(&right));
    assert_eq!(
        get(&b, &right, &[Value::Int(2)], "name"),
        Some(Value::from("deux"))
    );
}

/// Test that a second propagation over settled stores changes nothing
#[test]
fn test_repeated_propagation_is_idempotent() {
    let (a, b) = stores();
    let t = table("t");
    put(&a, &t, 1, "v", 10);
    put(&a, &t, 2, "v", 20);

    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    let (head_a, head_b) = (a.head(), b.head());
    bridge.propagate_all();
    bridge.propagate_all();

    assert!(a.head() == head_a);
    assert!(b.head() == head_b);
    assert_eq!(b.head().row_count(&t), 2);
}

/// Test that data outside the mapped region is left alone on the target
#[test]
fn test_unrelated_target_data_survives() {
    let (a, b) = stores();
    let (t, other) = (table("t"), table("other"));
    put(&b, &other, 7, "note", "keep me");

    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    put(&a, &t, 1, "v", "x");
    a.apply(|builder| builder.delete(&[Value::from(&t), Value::Int(1)]))
        .unwrap();

    assert_eq!(b.head().row_count(&t), 0);
    assert_eq!(
        get(&b, &other, &[Value::Int(7)], "note"),
        Some(Value::from("keep me"))
    );
    assert_eq!(a.head().row_count(&other), 0);
}

/// Test that an edit on the target made before a pass reaches it survives
/// that pass, and that later deletes from the source leave it alone
#[test]
fn test_concurrent_target_edit_survives_propagation() {
    let (a, b) = stores();
    let (t1, t2) = (table("t1"), table("t2"));
    let queue = Arc::new(QueuedDispatch::default());
    let bridge = ReplicationBridge::with_parts(
        BridgeConfig::default(),
        queue.clone(),
        Arc::new(PreferFork),
        Arc::new(RestrictBrokenReferences),
    )
    .unwrap();
    let _sub = bridge
        .register(&a, Path::table(t1.clone()), &b, Path::table(t2.clone()))
        .unwrap();
    queue.run_all();

    put(&a, &t1, 1, "v", "from a");
    put(&b, &t2, 2, "v", "from b");
    assert_eq!(get(&b, &t2, &[Value::Int(1)], "v"), None);
    assert!(queue.run_all() > 0);

    for (store, t) in [(&a, &t1), (&b, &t2)] {
        assert_eq!(get(store, t, &[Value::Int(1)], "v"), Some(Value::from("from a")));
        assert_eq!(get(store, t, &[Value::Int(2)], "v"), Some(Value::from("from b")));
    }

    a.apply(|builder| builder.delete(&[Value::from(&t1), Value::Int(1)]))
        .unwrap();
    queue.run_all();

    assert!(b.head().row(&t2, &[Value::Int(1)]).is_none());
    assert_eq!(get(&b, &t2, &[Value::Int(2)], "v"), Some(Value::from("from b")));
    assert_eq!(get(&a, &t1, &[Value::Int(2)], "v"), Some(Value::from("from b")));
}

/// Test that updates and removals of single cells are mirrored
#[test]
fn test_cell_update_and_removal() {
    let (a, b) = stores();
    let t = table("t");
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    put(&a, &t, 1, "color", "red");
    put(&a, &t, 1, "size", 3);
    put(&a, &t, 1, "color", "blue");
    assert_eq!(get(&b, &t, &[Value::Int(1)], "color"), Some(Value::from("blue")));

    a.apply(|builder| {
        builder.delete(&[Value::from(&t), Value::Int(1), Value::from(Column::new("color"))])
    })
    .unwrap();

    assert_eq!(get(&b, &t, &[Value::Int(1)], "color"), None);
    assert_eq!(get(&b, &t, &[Value::Int(1)], "size"), Some(Value::Int(3)));
}

/// Test that a row with only its key columns is mirrored
#[test]
fn test_key_only_row() {
    let (a, b) = stores();
    let t = table("t");
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    a.apply(|builder| builder.insert_row(&t, &[(Column::new("id"), Value::Int(5))]))
        .unwrap();

    assert!(b.head().row(&t, &[Value::Int(5)]).is_some());
}

/// Test composite primary keys, including deleting one row of a group
#[test]
fn test_multi_column_primary_key() {
    let (a, b) = stores();
    let t = lines();
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    a.apply(|builder| {
        for n in 1..=3 {
            builder.insert_row(
                &t,
                &[
                    (Column::new("order"), Value::Int(10)),
                    (Column::new("n"), Value::Int(n)),
                    (Column::new("sku"), Value::from(format!("sku-{}", n))),
                ],
            )?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(b.head().row_count(&t), 3);

    a.apply(|builder| builder.delete(&[Value::from(&t), Value::Int(10), Value::Int(2)]))
        .unwrap();

    assert_eq!(b.head().row_count(&t), 2);
    assert!(b.head().row(&t, &[Value::Int(10), Value::Int(2)]).is_none());
    assert_eq!(
        b.head()
            .get(&t, &[Value::Int(10), Value::Int(3)], &Column::new("sku")),
        Some(&Value::from("sku-3"))
    );
}

/// Test a row-rooted mapping whose target sits under a different key
#[test]
fn test_shifted_target_prefix() {
    let (a, b) = stores();
    let (src, dst) = (table("src"), table("dst"));
    put(&a, &src, 2, "v", "unmapped");

    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(
            &a,
            Path::new(src.clone(), vec![Value::Int(1)]),
            &b,
            Path::new(dst.clone(), vec![Value::Int(9)]),
        )
        .unwrap();

    put(&a, &src, 1, "v", "mapped");
    assert_eq!(get(&b, &dst, &[Value::Int(9)], "v"), Some(Value::from("mapped")));
    assert_eq!(b.head().row_count(&dst), 1);

    put(&b, &dst, 9, "w", "back");
    assert_eq!(get(&a, &src, &[Value::Int(1)], "w"), Some(Value::from("back")));

    a.apply(|builder| builder.delete(&[Value::from(&src), Value::Int(1)]))
        .unwrap();
    assert_eq!(b.head().row_count(&dst), 0);
    assert_eq!(get(&a, &src, &[Value::Int(2)], "v"), Some(Value::from("unmapped")));
}

/// Test that dropping a mirrored table removes the mirrored rows
#[test]
fn test_deleted_table_removes_rows() {
    let (a, b) = stores();
    let t = table("t");
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    put(&a, &t, 1, "v", "x");
    put(&a, &t, 2, "v", "y");
    a.apply(|builder| builder.delete(&[Value::from(&t)])).unwrap();

    assert_eq!(b.head().row_count(&t), 0);
}

/// Test that unregistering one of two mappings prunes only its trie entries
#[test]
fn test_unregister_prunes_trie() {
    let (a, b) = stores();
    let t = table("t");
    let bridge = ReplicationBridge::new(BridgeConfig::default()).unwrap();
    let first = bridge
        .register(
            &a,
            Path::new(t.clone(), vec![Value::Int(1)]),
            &b,
            Path::new(t.clone(), vec![Value::Int(1)]),
        )
        .unwrap();
    let _second = bridge
        .register(
            &a,
            Path::new(t.clone(), vec![Value::Int(2)]),
            &b,
            Path::new(t.clone(), vec![Value::Int(2)]),
        )
        .unwrap();
    assert_eq!(bridge.listener_count(), 2);

    first.cancel();
    assert!(bridge.check_pruned());
    assert_eq!(bridge.listener_count(), 2);

    put(&a, &t, 1, "v", "stays local");
    put(&a, &t, 2, "v", "mirrored");
    assert_eq!(get(&b, &t, &[Value::Int(1)], "v"), None);
    assert_eq!(get(&b, &t, &[Value::Int(2)], "v"), Some(Value::from("mirrored")));
}

/// Test registrations and cancellations racing on shared stores
#[test]
fn test_register_and_cancel_from_many_threads() {
    let (a, b) = stores();
    let t = table("t");
    let bridge = Arc::new(ReplicationBridge::new(BridgeConfig::default()).unwrap());

    let workers: Vec<_> = (0..4i64)
        .map(|n| {
            let (a, b, t, bridge) = (a.clone(), b.clone(), t.clone(), bridge.clone());
            std::thread::spawn(move || {
                for i in 0..25 {
                    let id = n * 1000 + i;
                    let sub = bridge
                        .register(
                            &a,
                            Path::new(t.clone(), vec![Value::Int(id)]),
                            &b,
                            Path::new(t.clone(), vec![Value::Int(id)]),
                        )
                        .unwrap();
                    put(&a, &t, id, "v", id);
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while get(&b, &t, &[Value::Int(id)], "v").is_none() {
                        assert!(Instant::now() < deadline, "row {} never mirrored", id);
                        std::thread::yield_now();
                    }
                    sub.cancel();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(bridge.listener_count(), 0);
    assert_eq!(a.listener_count(), 0);
    assert_eq!(b.listener_count(), 0);

    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();
    put(&a, &t, 9999, "v", "after");
    assert_eq!(get(&b, &t, &[Value::Int(9999)], "v"), Some(Value::from("after")));
}

/// Test that passes on a worker thread reach the same state
#[test]
fn test_worker_dispatch() {
    let (a, b) = stores();
    let t = table("t");
    let worker = Arc::new(WorkerDispatch::spawn("bridge-test").unwrap());
    let bridge = ReplicationBridge::with_parts(
        BridgeConfig::default(),
        worker.clone(),
        Arc::new(PreferFork),
        Arc::new(RestrictBrokenReferences),
    )
    .unwrap();
    let _sub = bridge
        .register(&a, Path::table(t.clone()), &b, Path::table(t.clone()))
        .unwrap();

    for id in 0..20 {
        put(&a, &t, id, "v", id * 2);
    }
    assert!(worker.wait_idle(Duration::from_secs(5)));

    assert_eq!(b.head().row_count(&t), 20);
    assert_eq!(get(&b, &t, &[Value::Int(19)], "v"), Some(Value::Int(38)));
}
