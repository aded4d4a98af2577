//! revflow Library
//!
//! Change propagation for a multi-master, revision-controlled store:
//! snapshot retention, live queries, store-to-store replication and the
//! wire codec that carries diffs between nodes.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;
pub mod wire;

// Re-export commonly used types
pub use adapters::MemoryStore;
pub use application::{LiveQueryEngine, RevisionLedger};
pub use config::load_config;
pub use domain::ports::{Store, StoreError, Subscription};
pub use domain::value_objects::{Column, Table, Value};
pub use replication::{BridgeConfig, Path, ReplicationBridge};
pub use wire::{CodecError, Message};
