//! Worker Pool
//!
//! Bounded pool of named worker threads that runs engine jobs off the
//! coordination thread. Shutdown drains queued tasks before joining.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Task function type
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Task handed back by a pool that has shut down
pub struct RejectedTask(pub TaskFn);

impl std::fmt::Debug for RejectedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RejectedTask")
    }
}

/// Shared task queue
struct WorkerQueue {
    /// Task queue
    tasks: Mutex<VecDeque<TaskFn>>,
    /// Condition variable for waiting
    condvar: Condvar,
    /// Shutdown flag
    shutdown: AtomicBool,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push(&self, task: TaskFn) -> Result<(), TaskFn> {
        let mut queue = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(task);
        }
        queue.push_back(task);
        self.condvar.notify_one();
        Ok(())
    }

    /// Next task; `None` once shut down and drained
    fn wait_for_task(&self) -> Option<TaskFn> {
        let mut queue = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }

            // Wait with timeout to check shutdown
            let result = self
                .condvar
                .wait_timeout(queue, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            queue = result.0;
        }
    }

    fn shutdown(&self) {
        let _queue = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        self.shutdown.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Worker {
    fn spawn(id: usize, queue: Arc<WorkerQueue>, active_tasks: Arc<AtomicUsize>) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("fos-bridge-worker-{}", id))
            .spawn(move || {
                while let Some(task) = queue.wait_for_task() {
                    active_tasks.fetch_add(1, Ordering::SeqCst);
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(worker = id, "Worker task panicked");
                    }
                    active_tasks.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::trace!(worker = id, "Worker exiting");
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

/// Bounded worker pool
pub struct WorkerPool {
    /// Worker threads
    workers: Mutex<Vec<Worker>>,
    /// Shared work queue
    queue: Arc<WorkerQueue>,
    /// Number of workers
    worker_count: usize,
    /// Active task count
    active_tasks: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("pending_tasks", &self.pending_tasks())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

impl WorkerPool {
    /// Create new pool with the given worker count (at least one)
    pub fn new(worker_count: usize) -> std::io::Result<Self> {
        let worker_count = worker_count.max(1);
        let queue = Arc::new(WorkerQueue::new());
        let active_tasks = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count)
            .map(|id| Worker::spawn(id, Arc::clone(&queue), Arc::clone(&active_tasks)))
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::debug!(workers = worker_count, "Worker pool started");

        Ok(Self {
            workers: Mutex::new(workers),
            queue,
            worker_count,
            active_tasks,
        })
    }

    /// Submit a task; hands it back if the pool is shut down
    pub fn submit<F>(&self, task: F) -> Result<(), RejectedTask>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task)).map_err(RejectedTask)
    }

    /// Get worker count
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Get pending task count
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Get active task count
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Check if pool is idle
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0 && self.active_tasks() == 0
    }

    /// Stop accepting tasks, run what is queued, join the workers
    pub fn shutdown(&self) {
        self.queue.shutdown();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for mut worker in workers {
            if let Some(thread) = worker.thread.take() {
                // A task that drops the last pool handle must not join itself
                if thread.thread().id() == current {
                    continue;
                }
                if thread.join().is_err() {
                    tracing::error!(worker = worker.id, "Worker thread panicked");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
