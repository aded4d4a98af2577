//! revflow - Change Propagation Demo Node
//!
//! This is the composition root that wires together all the components:
//! two stores kept in sync by a bridge, a live query over the replica, and
//! a diff carried through the framed wire transport.

use bytes::BytesMut;
use revflow::adapters::{MemoryBuilder, MemoryStore};
use revflow::application::{LiveQueryEngine, RevisionLedger};
use revflow::config::load_config;
use revflow::domain::ports::{RevisionBuilder, RowListener, Store, StoreError};
use revflow::domain::{Column, Expression, QueryTemplate, Table, TableReference, Value};
use revflow::replication::{MessageDecoder, MessageEncoder, NodeId, NodeKey, Path, ReplicationBridge};
use revflow::wire::{Diff, DiffBody, Message, Registry};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

/// Prints every result row change as one JSON line.
struct JsonRows {
    query: &'static str,
}

impl JsonRows {
    fn emit(&self, event: &str, row: &[Value]) {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        let line = serde_json::json!({ "query": self.query, "event": event, "row": cells });
        println!("{}", line);
    }
}

impl RowListener for JsonRows {
    fn handle_update(&mut self, row: &[Value]) {
        self.emit("update", row);
    }

    fn handle_delete(&mut self, row: &[Value]) {
        self.emit("delete", row);
    }
}

fn orders() -> Table {
    Table::new("orders", vec![Column::new("id")])
}

fn put_order(builder: &mut MemoryBuilder, id: i64, item: &str, qty: i64) -> Result<(), StoreError> {
    builder.insert_row(
        &orders(),
        &[
            (Column::new("id"), Value::Int(id)),
            (Column::new("item"), Value::from(item)),
            (Column::new("qty"), Value::Int(qty)),
        ],
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let node = NodeKey::new(Uuid::new_v4(), NodeId::new(cfg.node_id.clone()));
    tracing::info!("starting revflow node={} dispatch={}", node, cfg.bridge_dispatch);

    // ===== COMPOSITION ROOT =====

    // 1. Stores and the bridge between them
    let primary = Arc::new(MemoryStore::new());
    let replica = Arc::new(MemoryStore::new());
    let bridge = ReplicationBridge::new(cfg.bridge_config()?)?;
    let mirror = bridge.register(
        &primary,
        Path::table(orders()),
        &replica,
        Path::table(orders()),
    )?;

    // 2. Ledger and live query over the replica
    let ledger = RevisionLedger::new(replica.clone());
    let mut engine = LiveQueryEngine::new(ledger.clone());
    let r = TableReference::new(orders());
    let large_orders = Arc::new(QueryTemplate::new(
        vec![
            r.column(&Column::new("id")),
            r.column(&Column::new("item")),
            r.column(&Column::new("qty")),
        ],
        r.clone().into(),
        Expression::equal(r.column(&Column::new("qty")), Expression::parameter(0)),
    ));
    let subscription = engine.subscribe(
        JsonRows { query: "orders-by-qty" },
        large_orders,
        vec![Value::Int(10)],
    )?;

    // 3. Writes on the primary reach the replica through the bridge
    let tail = replica.head();
    primary.apply(|b| {
        put_order(b, 1, "bolts", 10)?;
        put_order(b, 2, "nuts", 4)?;
        put_order(b, 3, "washers", 10)
    })?;
    primary.apply(|b| b.delete(&[Value::from(orders()), Value::Int(3)]))?;
    let delivered = engine.drain()?;
    tracing::info!(
        "live query delivered rows={} base_sequence={}",
        delivered,
        engine.base_sequence()
    );

    // 4. Carry the replica's changes to a third store as a wire message
    let head = replica.head();
    let body = DiffBody::capture(replica.diff(&tail, &head, true).as_mut())?;
    let mut encoder = MessageEncoder::new(Registry::standard(), cfg.frame_max_bytes);
    let mut decoder = MessageDecoder::new(Registry::standard(), cfg.frame_max_bytes);
    let mut frames = BytesMut::new();
    encoder.encode(
        &Message::Diff(Diff {
            origin: node.clone(),
            start_sequence: 0,
            end_sequence: ledger.head().sequence(),
            body,
        }),
        &mut frames,
    )?;
    let frame_len = frames.len();

    let remote = MemoryStore::new();
    if let Some(Message::Diff(diff)) = decoder.decode(&mut frames)? {
        remote.apply(|b| diff.body.apply(b))?;
        tracing::info!(
            "diff applied origin={} bytes={} rows={}",
            diff.origin,
            frame_len,
            remote.head().row_count(&orders())
        );
    }

    // 5. Keep delivering until interrupted
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
        }
        let _ = shutdown_tx.send(());
    });
    engine.run(shutdown_rx).await?;

    subscription.cancel();
    mirror.cancel();
    tracing::info!("revflow stopped node={}", node);
    Ok(())
}
