//! Schedulers that run bell callbacks.
//!
//! Nothing in the engine runs a callback on the stack of the code that resolved a bell: every
//! callback is handed to a [`Dispatcher`], which is constructed explicitly and threaded through
//! bells, pipelines and transfers. Production code uses the tokio-backed dispatcher; tests that
//! need a fixed interleaving use [`ManualExecutor`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync + 'static {
    /// Runs `job` at some later point, never on the caller's stack.
    fn execute(&self, job: Job);
    /// Runs `job` once `delay` has elapsed.
    fn execute_after(&self, delay: Duration, job: Job);
}

#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn tokio(handle: tokio::runtime::Handle) -> Self {
        Self::new(Arc::new(TokioExecutor { handle }))
    }

    /// Dispatcher backed by the tokio runtime the caller is running on.
    pub fn current() -> crate::Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(anyhow::Error::from)?;
        Ok(Self::tokio(handle))
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(job));
    }

    pub fn execute_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.executor.execute_after(delay, Box::new(job));
    }
}

struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }

    fn execute_after(&self, delay: Duration, job: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            job()
        });
    }
}

struct Timer {
    due: Duration,
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct ManualState {
    queue: VecDeque<Job>,
    timers: Vec<Timer>,
    now: Duration,
    seq: u64,
}

/// Single-threaded executor driven by the test: jobs run in FIFO order when
/// [`run_until_idle`](Self::run_until_idle) is called, timers fire on [`advance`](Self::advance).
#[derive(Default)]
pub struct ManualExecutor {
    state: Mutex<ManualState>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    /// Runs queued jobs, including those queued by the jobs themselves, until none are left.
    /// Returns the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.state.lock().queue.pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Moves virtual time forward, queues every timer that became due (earliest first) and runs
    /// until idle.
    pub fn advance(&self, delay: Duration) -> usize {
        {
            let mut state = self.state.lock();
            state.now += delay;
            let now = state.now;
            let (mut due, pending): (Vec<Timer>, Vec<Timer>) =
                std::mem::take(&mut state.timers)
                    .into_iter()
                    .partition(|timer| timer.due <= now);
            state.timers = pending;
            due.sort_by_key(|timer| (timer.due, timer.seq));
            state.queue.extend(due.into_iter().map(|timer| timer.job));
        }
        self.run_until_idle()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.state.lock().queue.push_back(job);
    }

    fn execute_after(&self, delay: Duration, job: Job) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        state.seq += 1;
        let seq = state.seq;
        state.timers.push(Timer { due, seq, job });
    }
}
