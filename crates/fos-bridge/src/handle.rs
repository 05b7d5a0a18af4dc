//! Engine Handle
//!
//! One live engine plus the state the bridge keeps for it. Work on a handle
//! goes through its serial job queue: jobs run in submission order, one at a
//! time, on whichever pool worker is draining the queue. After each job the
//! handle asks the timer thread to wake it when the engine's next timer is due.

use crate::channel::ChannelTable;
use crate::pool::WorkerPool;
use crate::timers::TimerHandle;
use crate::BridgeError;
use fos_js::{EngineId, Interrupt, ScriptEngine};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Engine a job runs against, or why it cannot run
pub(crate) type EngineAccess<'a> = Result<&'a mut (dyn ScriptEngine + 'static), BridgeError>;

/// Work queued on one handle
pub(crate) type JobFn = Box<dyn for<'a> FnOnce(EngineAccess<'a>) + Send + 'static>;

/// Box a job closure
pub(crate) fn job<F>(f: F) -> JobFn
where
    F: for<'a> FnOnce(EngineAccess<'a>) + Send + 'static,
{
    Box::new(f)
}

enum Job {
    Exec(JobFn),
    /// Close and drop the engine
    Release,
}

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Ready,
    Closed,
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Job>,
    /// A worker owns the queue and will keep popping until it is empty
    draining: bool,
}

pub(crate) struct EngineHandle {
    id: EngineId,
    state: Mutex<HandleState>,
    /// Execution lock
    engine: Mutex<Option<Box<dyn ScriptEngine>>>,
    jobs: Mutex<JobQueue>,
    channels: Arc<ChannelTable>,
    hook_installed: AtomicBool,
    interrupt: Arc<Interrupt>,
    pool: Arc<WorkerPool>,
    timers: TimerHandle,
    /// Earliest wakeup already requested from the timer thread
    next_wakeup: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineHandle {
    pub(crate) fn new(id: EngineId, pool: Arc<WorkerPool>, timers: TimerHandle) -> Self {
        Self {
            id,
            state: Mutex::new(HandleState::Uninitialized),
            engine: Mutex::new(None),
            jobs: Mutex::new(JobQueue::default()),
            channels: Arc::new(ChannelTable::default()),
            hook_installed: AtomicBool::new(false),
            interrupt: Arc::new(Interrupt::new()),
            pool,
            timers,
            next_wakeup: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> EngineId {
        self.id
    }

    pub(crate) fn state(&self) -> HandleState {
        *lock(&self.state)
    }

    pub(crate) fn interrupt(&self) -> &Arc<Interrupt> {
        &self.interrupt
    }

    pub(crate) fn channels(&self) -> &Arc<ChannelTable> {
        &self.channels
    }

    /// Attach the created engine; `Uninitialized -> Ready`
    pub(crate) fn initialize(&self, engine: Box<dyn ScriptEngine>) {
        let mut state = lock(&self.state);
        if *state == HandleState::Uninitialized {
            *lock(&self.engine) = Some(engine);
            *state = HandleState::Ready;
        }
    }

    /// `true` for the first caller only
    pub(crate) fn claim_hook_install(&self) -> bool {
        !self.hook_installed.swap(true, Ordering::SeqCst)
    }

    /// Queue a job behind everything already submitted
    pub(crate) fn submit(self: &Arc<Self>, job: JobFn) {
        self.push(Job::Exec(job));
    }

    /// Mark closed, detach channels and release the engine once in-flight
    /// work is done. Jobs still queued fail with `EngineNotFound`.
    pub(crate) fn close(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if *state == HandleState::Closed {
                return;
            }
            *state = HandleState::Closed;
        }

        self.channels.detach();
        self.push(Job::Release);
        tracing::debug!(engine_id = self.id, "Engine handle closed");
    }

    fn push(self: &Arc<Self>, job: Job) {
        let start = {
            let mut queue = lock(&self.jobs);
            queue.jobs.push_back(job);
            !std::mem::replace(&mut queue.draining, true)
        };
        if !start {
            return;
        }

        let handle = Arc::clone(self);
        if self.pool.submit(move || handle.drain()).is_err() {
            tracing::warn!(engine_id = self.id, "Worker pool is shut down; cancelling queued jobs");
            self.cancel_queued();
        }
    }

    /// Queue a job that fires the engine's due timers
    pub(crate) fn fire_timers(self: &Arc<Self>) {
        *lock(&self.next_wakeup) = None;
        if self.state() != HandleState::Ready {
            return;
        }

        let id = self.id;
        self.submit(job(move |engine| {
            let Ok(engine) = engine else {
                return;
            };
            match engine.run_timers() {
                Ok(fired) => tracing::trace!(engine_id = id, fired, "Timers fired"),
                Err(e) => tracing::warn!(engine_id = id, error = %e, "Timer run failed"),
            }
        }));
    }

    /// Ask for a wakeup when `engine`'s next timer is due
    fn schedule_timers(self: &Arc<Self>, engine: &dyn ScriptEngine) {
        let Some(delay) = engine.next_timer() else {
            return;
        };
        let at = Instant::now() + delay;

        let mut next = lock(&self.next_wakeup);
        if matches!(*next, Some(scheduled) if scheduled <= at) {
            return;
        }
        *next = Some(at);
        self.timers.schedule(at, Arc::downgrade(self));
    }

    /// Pop and run jobs until the queue is empty
    fn drain(self: &Arc<Self>) {
        loop {
            let job = {
                let mut queue = lock(&self.jobs);
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            match job {
                Job::Exec(job) => self.run(job),
                Job::Release => self.release(),
            }
        }
    }

    fn run(self: &Arc<Self>, job: JobFn) {
        let closed = self.state() == HandleState::Closed;
        let mut slot = lock(&self.engine);

        let access = match slot.as_mut() {
            Some(engine) if !closed => Ok(&mut **engine),
            _ => Err(BridgeError::EngineNotFound(self.id)),
        };

        if panic::catch_unwind(AssertUnwindSafe(|| job(access))).is_err() {
            tracing::error!(engine_id = self.id, "Engine job panicked");
        }

        if let Some(engine) = slot.as_deref().filter(|_| !closed) {
            self.schedule_timers(engine);
        }
    }

    fn release(&self) {
        let engine = lock(&self.engine).take();
        if let Some(mut engine) = engine {
            engine.close();
            tracing::debug!(engine_id = self.id, "Engine released");
        }
    }

    /// Fail every queued job when no worker can take them
    fn cancel_queued(&self) {
        let jobs = {
            let mut queue = lock(&self.jobs);
            queue.draining = false;
            std::mem::take(&mut queue.jobs)
        };

        for job in jobs {
            match job {
                Job::Exec(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| job(Err(BridgeError::Cancelled)))).is_err() {
                        tracing::error!(engine_id = self.id, "Engine job panicked");
                    }
                }
                Job::Release => self.release(),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_jobs(&self) -> usize {
        lock(&self.jobs).jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::TimerThread;
    use fos_js::{EngineBackend, EngineConfig, EngineOptions, ScriptValue, StubBackend};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Handle onto a timer thread that has already stopped
    fn idle_timers() -> TimerHandle {
        TimerThread::start().unwrap().handle()
    }

    fn ready_handle(id: EngineId, pool: &Arc<WorkerPool>) -> Arc<EngineHandle> {
        let handle = Arc::new(EngineHandle::new(id, Arc::clone(pool), idle_timers()));
        let runtime = StubBackend::new(EngineConfig::default()).start().unwrap();
        let engine = runtime
            .create_engine(EngineOptions::with_interrupt(id, Arc::clone(handle.interrupt())))
            .unwrap();
        handle.initialize(engine);
        handle
    }

    fn eval_job(code: &'static str, tx: mpsc::Sender<Result<ScriptValue, BridgeError>>) -> JobFn {
        job(move |engine| {
            let result = engine.and_then(|engine| {
                engine
                    .evaluate(code)
                    .map_err(|e| BridgeError::evaluation(engine.id(), e))
            });
            tx.send(result).unwrap();
        })
    }

    #[test]
    fn test_state_transitions() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let handle = Arc::new(EngineHandle::new(1, Arc::clone(&pool), idle_timers()));
        assert_eq!(handle.state(), HandleState::Uninitialized);

        let handle = ready_handle(1, &pool);
        assert_eq!(handle.state(), HandleState::Ready);

        handle.close();
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn test_jobs_run_in_order() {
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        let handle = ready_handle(1, &pool);
        let (tx, rx) = mpsc::channel();

        handle.submit(eval_job("var x = 1", tx.clone()));
        handle.submit(eval_job("x + 1", tx.clone()));
        handle.submit(eval_job("x * 10", tx));

        let results: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        assert_eq!(results[1], ScriptValue::Number(2.0));
        assert_eq!(results[2], ScriptValue::Number(10.0));
    }

    #[test]
    fn test_close_fails_queued_jobs() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let handle = ready_handle(7, &pool);
        let (tx, rx) = mpsc::channel();

        handle.submit(eval_job("sleep(100)", tx.clone()));
        handle.close();
        handle.submit(eval_job("1", tx));

        let in_flight = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(in_flight.is_ok());
        let queued = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(queued, Err(BridgeError::EngineNotFound(7)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let handle = ready_handle(1, &pool);

        handle.close();
        handle.close();
        pool.shutdown();
        assert_eq!(handle.queued_jobs(), 0);
        assert!(lock(&handle.engine).is_none());
    }

    #[test]
    fn test_hook_claimed_once() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let handle = ready_handle(1, &pool);
        assert!(handle.claim_hook_install());
        assert!(!handle.claim_hook_install());
    }

    #[test]
    fn test_submit_after_pool_shutdown_cancels() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let handle = ready_handle(1, &pool);
        pool.shutdown();

        let (tx, rx) = mpsc::channel();
        handle.submit(eval_job("1", tx));
        assert_eq!(rx.try_recv().unwrap(), Err(BridgeError::Cancelled));
    }

    #[test]
    fn test_fire_timers_on_closed_handle() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let handle = ready_handle(1, &pool);

        handle.close();
        handle.fire_timers();
        pool.shutdown();
        assert_eq!(handle.queued_jobs(), 0);
        assert!(lock(&handle.next_wakeup).is_none());
    }
}
