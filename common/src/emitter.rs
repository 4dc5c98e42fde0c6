//! Bell-based producer/consumer queue.
//!
//! Resources stream directory listings through an [`Emitter`]: the producer calls
//! [`emit`](Emitter::emit) for every name and [`finish`](Emitter::finish) (or
//! [`fail`](Emitter::fail)) at the end, the consumer asks for one item at a time with
//! [`next`](Emitter::next). Items that arrive before anyone asked are buffered.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct State<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Bell<Option<T>>>,
    end: Option<Result<()>>,
}

pub struct Emitter<T> {
    dispatcher: Dispatcher,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Emitter")
            .field("buffered", &state.items.len())
            .field("waiting", &state.waiters.len())
            .field("ended", &state.end.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Emitter<T> {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            state: Arc::new(Mutex::new(State {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                end: None,
            })),
        }
    }

    /// An emitter that ends with `error` without producing anything.
    pub fn failed(dispatcher: &Dispatcher, error: Error) -> Self {
        let emitter = Self::new(dispatcher);
        emitter.fail(error);
        emitter
    }

    pub fn from_iter(dispatcher: &Dispatcher, items: impl IntoIterator<Item = T>) -> Self {
        let emitter = Self::new(dispatcher);
        for item in items {
            emitter.emit(item);
        }
        emitter.finish();
        emitter
    }

    /// Hands `item` to the oldest waiting consumer or buffers it. Returns `false` if the
    /// emitter already ended.
    pub fn emit(&self, item: T) -> bool {
        let waiter = {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return false;
            }
            match state.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    state.items.push_back(item);
                    return true;
                }
            }
        };
        waiter.ring(Some(item));
        true
    }

    pub fn finish(&self) -> bool {
        self.end(Ok(()))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.end(Err(error))
    }

    fn end(&self, end: Result<()>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return false;
            }
            state.end = Some(end.clone());
            std::mem::take(&mut state.waiters)
        };
        // buffered items only exist while nobody waits, so every waiter sees the end
        for waiter in waiters {
            match &end {
                Ok(()) => waiter.ring(None),
                Err(error) => waiter.ring_err(error.clone()),
            };
        }
        true
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().end.is_some()
    }

    /// The next item, `None` once the emitter finished, or the error it failed with. Buffered
    /// items are delivered before the end.
    pub fn next(&self) -> Bell<Option<T>> {
        let mut state = self.state.lock();
        if let Some(item) = state.items.pop_front() {
            return Bell::resolved(&self.dispatcher, Some(item));
        }
        match &state.end {
            Some(Ok(())) => Bell::resolved(&self.dispatcher, None),
            Some(Err(error)) => Bell::failed(&self.dispatcher, error.clone()),
            None => {
                let waiter = Bell::new(&self.dispatcher);
                state.waiters.push_back(waiter.clone());
                waiter
            }
        }
    }

    /// Calls `f` for every item; the returned bell settles when the emitter ends.
    pub fn for_each(&self, f: impl FnMut(T) + Send + 'static) -> Bell<()> {
        let done = Bell::new(&self.dispatcher);
        pump(self.clone(), f, done.clone());
        done
    }

    pub fn collect(&self) -> Bell<Vec<T>> {
        let items = Arc::new(Mutex::new(vec![]));
        let sink = items.clone();
        self.for_each(move |item| sink.lock().push(item))
            .map(move |()| std::mem::take(&mut *items.lock()))
    }

    /// Adapts the emitter to a [`futures::Stream`] of results; the stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<T>> + Send {
        futures::stream::unfold(Some(self), |emitter| async move {
            let emitter = emitter?;
            match emitter.next().get().await {
                Ok(Some(item)) => Some((Ok(item), Some(emitter))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

fn pump<T, F>(emitter: Emitter<T>, mut f: F, done: Bell<()>)
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    let next = emitter.next();
    next.on_always(move |result| match result {
        Ok(Some(item)) => {
            f(item.clone());
            pump(emitter, f, done);
        }
        Ok(None) => {
            done.ring(());
        }
        Err(error) => {
            done.ring_err(error.clone());
        }
    });
}
