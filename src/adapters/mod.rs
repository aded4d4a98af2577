//! Adapters Layer
//!
//! Implementations of the domain ports.

pub mod outbound;

pub use outbound::{MemoryBuilder, MemoryRevision, MemoryStore};
