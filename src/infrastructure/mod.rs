//! Infrastructure Layer
//!
//! Runtime plumbing behind the domain ports.

pub mod dispatch;

pub use dispatch::{DirectDispatch, WorkerDispatch};
