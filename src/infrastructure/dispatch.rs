//! Task Dispatchers
//!
//! `TaskDispatch` implementations: run inline on the notifying thread, or
//! queue onto a dedicated worker thread.

use crate::domain::ports::{Task, TaskDispatch};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDispatch;

impl TaskDispatch for DirectDispatch {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Count of tasks submitted but not yet finished. Waiters are woken when
/// it drops to zero.
#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }

    fn wait_zero(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Runs tasks one at a time, in submission order, on a dedicated thread.
pub struct WorkerDispatch {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    queued: Arc<Outstanding>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerDispatch {
    /// Start the worker thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let queued = Arc::new(Outstanding::default());

        let counter = queued.clone();
        let thread_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!("dispatch worker started name={}", thread_name);
                while let Some(task) = receiver.blocking_recv() {
                    task();
                    counter.done();
                }
                tracing::debug!("dispatch worker stopped name={}", thread_name);
            })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            queued,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks submitted and not yet finished.
    pub fn queued(&self) -> usize {
        self.queued.get()
    }

    /// Wait until the queue is empty, including tasks submitted by tasks.
    ///
    /// Returns `false` on timeout. Must not be called from the worker itself.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queued.wait_zero(Instant::now() + timeout)
    }

    /// Stop accepting tasks, let the queue drain, and join the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // The last handle may be dropped by a task running on the worker.
        if worker.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("dispatch worker panicked name={}", self.name);
        }
    }
}

impl TaskDispatch for WorkerDispatch {
    fn dispatch(&self, task: Task) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            tracing::warn!("task dropped after shutdown name={}", self.name);
            return;
        };
        self.queued.add();
        if sender.send(task).is_err() {
            self.queued.done();
            tracing::warn!("task dropped, worker gone name={}", self.name);
        }
    }
}

impl Drop for WorkerDispatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}
