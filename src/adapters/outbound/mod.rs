mod memory_query;
mod memory_store;

pub use memory_query::evaluate;
pub use memory_store::{MemoryBuilder, MemoryRevision, MemoryStore, Row};
