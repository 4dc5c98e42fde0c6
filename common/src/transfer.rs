//! Controllable handles over one data movement.
//!
//! A transfer goes from not started to running on [`start`](Transfer::start) and to stopped on
//! the first of [`stop`](Transfer::stop), [`stop_with`](Transfer::stop_with) or
//! [`cancel`](Transfer::cancel). Both transitions happen once; repeating them does nothing.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::progress::{Progress, Summary};
use crate::resource::Resource;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferOptions {
    concurrency: usize,
    /// Stop everything on the first error instead of letting the rest of the tree finish.
    pub fail_early: bool,
    /// Reuse directories that already exist at the destination.
    pub overwrite: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            fail_early: false,
            overwrite: false,
        }
    }
}

impl TransferOptions {
    /// Maximum number of simultaneous file transfers; values below 1 are raised to 1.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = std::cmp::max(1, concurrency);
        self
    }

    #[must_use]
    pub fn with_fail_early(mut self, fail_early: bool) -> Self {
        self.fail_early = fail_early;
        self
    }

    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn concurrency(&self) -> usize {
        std::cmp::max(1, self.concurrency)
    }
}

/// Failure of a whole transfer, together with what it managed to do.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: crate::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: crate::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

/// Start/stop state and counters shared by every transfer implementation.
#[derive(Debug)]
pub struct Control {
    dispatcher: Dispatcher,
    started: Bell<()>,
    stopped: Bell<()>,
    progress: Arc<Progress>,
}

impl Control {
    /// Both endpoints are told about the outcome through [`Resource::transfer_done`] once the
    /// transfer stops.
    pub fn new<S: Resource, D: Resource>(source: &S, destination: &D) -> Self {
        let dispatcher = source.dispatcher().clone();
        let progress = Arc::new(Progress::new());
        let stopped = Bell::new(&dispatcher);
        {
            let source = source.clone();
            let destination = destination.clone();
            stopped.on_always(move |outcome| {
                match outcome {
                    Ok(()) => tracing::debug!(
                        "transfer {:?} -> {:?} finished",
                        source.path(),
                        destination.path()
                    ),
                    Err(error) => tracing::debug!(
                        "transfer {:?} -> {:?} stopped: {}",
                        source.path(),
                        destination.path(),
                        error
                    ),
                }
                source.transfer_done(outcome);
                destination.transfer_done(outcome);
            });
        }
        Self {
            started: Bell::new(&dispatcher),
            stopped,
            progress,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Moves to running. Returns `true` only for the call that did it; a transfer that was
    /// stopped before it started never runs.
    pub fn begin(&self) -> bool {
        if self.stopped.is_resolved() {
            self.started
                .ring_err(crate::Error::msg("transfer was stopped before it started"));
            return false;
        }
        if !self.started.ring(()) {
            return false;
        }
        self.progress.mark_started();
        true
    }

    /// Moves to stopped. Returns `true` only for the call that did it.
    pub fn end(&self, outcome: crate::Result<()>) -> bool {
        if !self.stopped.ring_result(outcome) {
            return false;
        }
        self.progress.mark_stopped();
        true
    }

    pub fn started(&self) -> &Bell<()> {
        &self.started
    }

    pub fn stopped(&self) -> &Bell<()> {
        &self.stopped
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }
}

/// One data movement from a source resource to a destination resource.
pub trait Transfer: Send + Sync {
    type Source: Resource;
    type Destination: Resource;

    fn source(&self) -> &Self::Source;

    fn destination(&self) -> &Self::Destination;

    fn control(&self) -> &Control;

    /// Begins moving data. Runs once, from the [`start`](Self::start) call that started the
    /// transfer.
    fn run(&self);

    /// The returned bell resolves once the transfer is running.
    fn start(&self) -> Bell<()> {
        if self.control().begin() {
            self.run();
        }
        self.control().started().clone()
    }

    fn stop(&self) -> bool {
        self.control().end(Ok(()))
    }

    fn stop_with(&self, error: crate::Error) -> bool {
        self.control().end(Err(error))
    }

    fn cancel(&self) -> bool {
        self.stop_with(crate::Error::Cancelled)
    }

    fn on_start(&self) -> &Bell<()> {
        self.control().started()
    }

    /// Carries the transfer's outcome: the first recorded error, if any.
    fn on_stop(&self) -> &Bell<()> {
        self.control().stopped()
    }

    fn progress(&self) -> &Progress {
        self.control().progress()
    }

    fn summary(&self) -> Summary {
        self.progress().summary()
    }

    /// Average bytes per second.
    fn throughput(&self) -> f64 {
        self.progress().throughput()
    }
}

/// Waits until `transfer` stops and reports what it did.
pub async fn finished<T: Transfer + ?Sized>(transfer: &T) -> Result<Summary, Error> {
    let outcome = transfer.on_stop().get().await;
    let summary = transfer.summary();
    match outcome {
        Ok(()) => Ok(summary),
        Err(source) => Err(Error::new(source, summary)),
    }
}
