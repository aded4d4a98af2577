//! Task Dispatch Port
//!
//! Store notifications must not block, so components that do real work in
//! response hand it to a dispatcher which decides where it runs.

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskDispatch: Send + Sync {
    fn dispatch(&self, task: Task);
}
