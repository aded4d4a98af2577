mod resolvers;
mod row_listener;
mod store;
mod task_dispatch;

pub use resolvers::{
    Conflict, ConflictResolver, DeleteBrokenReferences, ForeignKeyAction, ForeignKeyResolver,
    PreferFork, PreferHead, RestrictBrokenReferences,
};
pub use row_listener::RowListener;
pub use store::{
    DiffCursor, QueryCursor, RevisionBuilder, Store, StoreError, StoreListener, Subscription,
};
pub use task_dispatch::{Task, TaskDispatch};
