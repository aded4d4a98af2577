//! Application Layer
//!
//! Revision sequencing and live queries built on the store port.

pub mod ledger;
pub mod live_query;

pub use ledger::{Lease, LedgerError, LedgerListener, LinearRevision, ListenerId, RevisionLedger};
pub use live_query::{LiveQueryEngine, MatcherId, QuerySubscription, SubscribeError};
