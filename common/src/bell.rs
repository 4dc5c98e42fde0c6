//! Single-assignment asynchronous results.
//!
//! A [`Bell`] starts unresolved and is rung exactly once, either with a value or with an
//! [`Error`]. Later rings are ignored. Anything that wants the outcome registers a callback
//! (a handler or a dependent bell) and the bell's [`Dispatcher`] runs those callbacks after
//! resolution, in registration order, with handlers ahead of dependent bells.
//!
//! Callbacks are never invoked while the bell's lock is held and never on the stack of the
//! caller that rang the bell or registered the callback. Each bell drains its callback queue
//! from a single dispatched job at a time, which is what fixes the order.
//!
//! ```rust,no_run
//! use common::bell::Bell;
//! use common::dispatch::Dispatcher;
//!
//! # async fn example() -> common::Result<()> {
//! let dispatcher = Dispatcher::current()?;
//! let size = Bell::<u64>::new(&dispatcher);
//! let doubled = size.map(|size| size * 2);
//! size.ring(21);
//! assert_eq!(doubled.get().await?, 42);
//! # Ok(())
//! # }
//! ```

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct State<T> {
    outcome: Option<Arc<Result<T>>>,
    handlers: VecDeque<Callback<T>>,
    promises: VecDeque<Callback<T>>,
    dispatching: bool,
}

impl<T> State<T> {
    // must be called with the lock held; the caller schedules a drain when this returns true
    fn claim_dispatch(&mut self) -> bool {
        if self.outcome.is_none() || self.dispatching {
            return false;
        }
        if self.handlers.is_empty() && self.promises.is_empty() {
            return false;
        }
        self.dispatching = true;
        true
    }
}

struct Shared<T> {
    dispatcher: Dispatcher,
    state: Mutex<State<T>>,
    resolved: Condvar,
}

pub struct Bell<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Bell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Bell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        let status = match state.outcome.as_deref() {
            None => "unresolved",
            Some(Ok(_)) => "done",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Bell").field("status", &status).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Bell<T> {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher: dispatcher.clone(),
                state: Mutex::new(State {
                    outcome: None,
                    handlers: VecDeque::new(),
                    promises: VecDeque::new(),
                    dispatching: false,
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    pub fn resolved(dispatcher: &Dispatcher, value: T) -> Self {
        let bell = Self::new(dispatcher);
        bell.ring(value);
        bell
    }

    pub fn failed(dispatcher: &Dispatcher, error: Error) -> Self {
        let bell = Self::new(dispatcher);
        bell.ring_err(error);
        bell
    }

    pub fn from_result(dispatcher: &Dispatcher, result: Result<T>) -> Self {
        let bell = Self::new(dispatcher);
        bell.ring_result(result);
        bell
    }

    /// Runs `future` on `handle` and rings the returned bell with its result.
    pub fn from_future<F>(dispatcher: &Dispatcher, handle: &tokio::runtime::Handle, future: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let bell = Self::new(dispatcher);
        let ringer = bell.clone();
        handle.spawn(async move {
            ringer.ring_result(future.await);
        });
        bell
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn ring(&self, value: T) -> bool {
        self.ring_result(Ok(value))
    }

    pub fn ring_err(&self, error: Error) -> bool {
        self.ring_result(Err(error))
    }

    /// Resolves the bell. Returns `false`, leaving the bell untouched, if it was already
    /// resolved.
    pub fn ring_result(&self, result: Result<T>) -> bool {
        let schedule = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(Arc::new(result));
            state.claim_dispatch()
        };
        self.shared.resolved.notify_all();
        if schedule {
            self.schedule_drain();
        }
        true
    }

    /// Fails an unresolved bell with [`Error::Cancelled`]. Returns whether it took effect.
    pub fn cancel(&self) -> bool {
        self.ring_err(Error::Cancelled)
    }

    /// Fails the bell with [`Error::Timeout`] if it is still unresolved after `timeout`.
    ///
    /// Whatever is producing the value is not told about it; callers that want the producer
    /// stopped have to watch for the timeout themselves.
    pub fn deadline(&self, timeout: Duration) -> Self {
        let weak = Arc::downgrade(&self.shared);
        self.shared.dispatcher.execute_after(timeout, move || {
            if let Some(shared) = weak.upgrade() {
                Bell { shared }.ring_err(Error::Timeout);
            }
        });
        self.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.shared.state.lock().outcome.as_deref(), Some(Ok(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.shared.state.lock().outcome.as_deref(), Some(Err(_)))
    }

    /// The outcome, if the bell has been rung.
    pub fn outcome(&self) -> Option<Result<T>> {
        let state = self.shared.state.lock();
        state.outcome.as_deref().cloned()
    }

    fn push(&self, callback: Callback<T>, promise: bool) {
        let schedule = {
            let mut state = self.shared.state.lock();
            if promise {
                state.promises.push_back(callback);
            } else {
                state.handlers.push_back(callback);
            }
            state.claim_dispatch()
        };
        if schedule {
            self.schedule_drain();
        }
    }

    fn schedule_drain(&self) {
        let shared = self.shared.clone();
        self.shared.dispatcher.execute(move || drain(&shared));
    }

    pub fn on_always(&self, handler: impl FnOnce(&Result<T>) + Send + 'static) -> &Self {
        self.push(Box::new(handler), false);
        self
    }

    pub fn on_done(&self, handler: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.on_always(move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        })
    }

    pub fn on_fail(&self, handler: impl FnOnce(&Error) + Send + 'static) -> &Self {
        self.on_always(move |result| {
            if let Err(error) = result {
                handler(error);
            }
        })
    }

    /// Resolves `other` with this bell's outcome once it is known. Does nothing if `other` is
    /// already resolved.
    pub fn promise(&self, other: &Bell<T>) -> &Self {
        if other.is_resolved() {
            return self;
        }
        let other = other.clone();
        self.push(
            Box::new(move |result| {
                other.ring_result(result.clone());
            }),
            true,
        );
        self
    }

    /// Maps success onto a fixed value; failures pass through.
    pub fn replace<U: Clone + Send + Sync + 'static>(&self, value: U) -> Bell<U> {
        self.map(move |_| value)
    }

    pub fn map<U, F>(&self, f: F) -> Bell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(move |value| Ok(f(value)))
    }

    /// Fallible map: an `Err` from `f` fails the derived bell.
    pub fn then<U, F>(&self, f: F) -> Bell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let out = Bell::new(self.dispatcher());
        let ringer = out.clone();
        self.on_always(move |result| {
            ringer.ring_result(result.clone().and_then(f));
        });
        out
    }

    /// Chains an asynchronous step: on success `f` produces the bell whose outcome the derived
    /// bell takes. `f` is skipped if the derived bell was already resolved, e.g. cancelled.
    pub fn and_then<U, F>(&self, f: F) -> Bell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Bell<U> + Send + 'static,
    {
        let out = Bell::new(self.dispatcher());
        let ringer = out.clone();
        self.on_always(move |result| {
            if ringer.is_resolved() {
                return;
            }
            match result {
                Ok(value) => {
                    f(value.clone()).promise(&ringer);
                }
                Err(error) => {
                    ringer.ring_err(error.clone());
                }
            }
        });
        out
    }

    /// Recovers from failure: `f` produces the bell whose outcome replaces the error.
    pub fn or_else<F>(&self, f: F) -> Bell<T>
    where
        F: FnOnce(Error) -> Bell<T> + Send + 'static,
    {
        let out = Bell::new(self.dispatcher());
        let ringer = out.clone();
        self.on_always(move |result| {
            if ringer.is_resolved() {
                return;
            }
            match result {
                Ok(value) => {
                    ringer.ring(value.clone());
                }
                Err(error) => {
                    f(error.clone()).promise(&ringer);
                }
            }
        });
        out
    }

    /// Succeeds with `other`'s value if both succeed, otherwise fails with whichever failure
    /// is observed first.
    pub fn and<U: Clone + Send + Sync + 'static>(&self, other: &Bell<U>) -> Bell<U> {
        let out = Bell::new(self.dispatcher());
        let ringer = out.clone();
        let second = other.clone();
        self.on_always(move |result| match result {
            Ok(_) => {
                second.promise(&ringer);
            }
            Err(error) => {
                ringer.ring_err(error.clone());
            }
        });
        let ringer = out.clone();
        other.on_fail(move |error| {
            ringer.ring_err(error.clone());
        });
        out
    }

    /// Succeeds with the first success of either bell; fails only when both fail, with this
    /// bell's error.
    pub fn or(&self, other: &Bell<T>) -> Bell<T> {
        #[derive(Default)]
        struct Failures {
            mine: Option<Error>,
            theirs: bool,
        }
        let out = Bell::new(self.dispatcher());
        let failures = Arc::new(Mutex::new(Failures::default()));
        {
            let ringer = out.clone();
            let failures = failures.clone();
            self.on_always(move |result| match result {
                Ok(value) => {
                    ringer.ring(value.clone());
                }
                Err(error) => {
                    let both = {
                        let mut failures = failures.lock();
                        failures.mine = Some(error.clone());
                        failures.theirs
                    };
                    if both {
                        ringer.ring_err(error.clone());
                    }
                }
            });
        }
        let ringer = out.clone();
        other.on_always(move |result| match result {
            Ok(value) => {
                ringer.ring(value.clone());
            }
            Err(_) => {
                let mine = {
                    let mut failures = failures.lock();
                    failures.theirs = true;
                    failures.mine.clone()
                };
                if let Some(error) = mine {
                    ringer.ring_err(error);
                }
            }
        });
        out
    }

    /// Succeeds with the first success among `bells`; fails once all of them have failed,
    /// with the error of the last one to fail. An empty collection fails immediately.
    pub fn any(dispatcher: &Dispatcher, bells: impl IntoIterator<Item = Bell<T>>) -> Bell<T> {
        let bells: Vec<_> = bells.into_iter().collect();
        if bells.is_empty() {
            return Bell::failed(dispatcher, Error::NotFound("no bells to wait on".to_string()));
        }
        let out = Bell::new(dispatcher);
        let remaining = Arc::new(Mutex::new(bells.len()));
        for bell in bells {
            let ringer = out.clone();
            let remaining = remaining.clone();
            bell.on_always(move |result| match result {
                Ok(value) => {
                    ringer.ring(value.clone());
                }
                Err(error) => {
                    let last = {
                        let mut remaining = remaining.lock();
                        *remaining -= 1;
                        *remaining == 0
                    };
                    if last {
                        ringer.ring_err(error.clone());
                    }
                }
            });
        }
        out
    }

    /// Succeeds with every value, in input order, once all succeed; fails on the first
    /// failure.
    pub fn all(dispatcher: &Dispatcher, bells: impl IntoIterator<Item = Bell<T>>) -> Bell<Vec<T>> {
        let bells: Vec<_> = bells.into_iter().collect();
        if bells.is_empty() {
            return Bell::resolved(dispatcher, vec![]);
        }
        let out = Bell::new(dispatcher);
        let slots: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; bells.len()], bells.len())));
        for (index, bell) in bells.into_iter().enumerate() {
            let ringer = out.clone();
            let slots = slots.clone();
            bell.on_always(move |result| match result {
                Ok(value) => {
                    let complete = {
                        let mut slots = slots.lock();
                        slots.0[index] = Some(value.clone());
                        slots.1 -= 1;
                        if slots.1 == 0 {
                            Some(std::mem::take(&mut slots.0))
                        } else {
                            None
                        }
                    };
                    if let Some(values) = complete {
                        ringer.ring(values.into_iter().flatten().collect());
                    }
                }
                Err(error) => {
                    ringer.ring_err(error.clone());
                }
            });
        }
        out
    }

    /// Succeeds once every bell is resolved, whatever the individual outcomes.
    pub fn wait(dispatcher: &Dispatcher, bells: impl IntoIterator<Item = Bell<T>>) -> Bell<()> {
        let bells: Vec<_> = bells.into_iter().collect();
        if bells.is_empty() {
            return Bell::resolved(dispatcher, ());
        }
        let out = Bell::new(dispatcher);
        let remaining = Arc::new(Mutex::new(bells.len()));
        for bell in bells {
            let ringer = out.clone();
            let remaining = remaining.clone();
            bell.on_always(move |_| {
                let last = {
                    let mut remaining = remaining.lock();
                    *remaining -= 1;
                    *remaining == 0
                };
                if last {
                    ringer.ring(());
                }
            });
        }
        out
    }

    /// Waits for the outcome without blocking the thread.
    pub async fn get(&self) -> Result<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_always(move |result| {
            let _ = tx.send(result.clone());
        });
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Blocks the current thread until the bell resolves.
    ///
    /// Never call this from a dispatched callback: the callback may be the job that would
    /// have resolved the bell.
    pub fn blocking_get(&self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.as_deref() {
                return outcome.clone();
            }
            self.shared.resolved.wait(&mut state);
        }
    }

    /// Like [`blocking_get`](Self::blocking_get) but gives up with [`Error::Timeout`] after
    /// `timeout`. The bell itself is left unresolved.
    pub fn blocking_get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.as_deref() {
                return outcome.clone();
            }
            if self
                .shared
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.outcome.as_deref() {
                    Some(outcome) => outcome.clone(),
                    None => Err(Error::Timeout),
                };
            }
        }
    }
}

fn drain<T>(shared: &Arc<Shared<T>>) {
    loop {
        let (callback, outcome) = {
            let mut state = shared.state.lock();
            let Some(outcome) = state.outcome.clone() else {
                state.dispatching = false;
                return;
            };
            match state
                .handlers
                .pop_front()
                .or_else(|| state.promises.pop_front())
            {
                Some(callback) => (callback, outcome),
                None => {
                    state.dispatching = false;
                    return;
                }
            }
        };
        callback(&*outcome);
    }
}
