//! Replication Module
//!
//! Keeps regions of independent stores mirrored in both directions and
//! carries revision diffs between peers.
//!
//! ## Architecture
//!
//! - **Bridge**: registers pairs of store paths and owns one listener per
//!   source store
//! - **Sync**: walks the diff since the last propagated revision and
//!   rewrites matching cells under each target prefix
//! - **Trie**: indexes mapping source paths for the walk
//! - **Transport**: checksummed frames carrying wire-encoded messages
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revflow::replication::{BridgeConfig, Path, ReplicationBridge};
//!
//! let bridge = ReplicationBridge::new(BridgeConfig::default())?;
//! let subscription = bridge.register(
//!     &left,
//!     Path::table(orders.clone()),
//!     &right,
//!     Path::table(orders),
//! )?;
//! ```

mod bridge;
mod config;
mod sync;
mod transport;
mod trie;
mod types;

pub use bridge::{BridgeError, ReplicationBridge};
pub use config::{BridgeConfig, ConfigError, DispatchMode, DEPTH_LIMIT, MAX_PATH_DEPTH};
pub use transport::{
    decode_frame, encode_frame, read_frame, write_frame, Connection, FrameError, MessageDecoder,
    MessageEncoder, DEFAULT_MAX_FRAME, HEADER_LEN,
};
pub use trie::{NodeIndex, PathTrie, TrieCursor};
pub use types::{MappingId, NodeId, NodeKey, NodeKeyError, Path};
