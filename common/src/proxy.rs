//! Protocol-agnostic tree transfer.
//!
//! [`ProxyTransfer`] walks the source tree through the [`Resource`] contract alone: it stats
//! each path, creates directories on the destination, lists them and connects the source's
//! tap to the destination's sink for every file. Neither endpoint needs to know about the
//! other.
//!
//! Paths are tracked relative to the transfer root (the root itself is the empty path) in
//! three places:
//!
//! - `pending`: paths waiting for a free slot; children of a listed directory go to the front,
//!   requests that arrive while the transfer is busy go to the back,
//! - `transferring`: paths being stat'ed, created or copied; never more than the configured
//!   concurrency,
//! - `listing`: directories whose children are still being read; these take no slot.
//!
//! The transfer stops once all three are empty. A failure only ends its own branch unless
//! `fail_early` is set; the first recorded error is what the transfer stops with.

use crate::bell::Bell;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::pipe::{Flow, Outlet, Pipe, Pipeline};
use crate::progress::Progress;
use crate::resource::{resolve, Resource};
use crate::slice::Slice;
use crate::stat::Stat;
use crate::transfer::{Control, Transfer, TransferOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Counts bytes as the downstream accepts them.
struct MonitorPipe {
    progress: Arc<Progress>,
}

impl Pipe for MonitorPipe {
    fn drain(&self, slice: Slice, next: &Outlet) -> Bell<()> {
        let len = slice.len() as u64;
        let accepted = next.drain(slice);
        let progress = self.progress.clone();
        accepted.on_done(move |()| progress.bytes_transferred.add(len));
        accepted
    }
}

struct Deferred {
    path: PathBuf,
    started: Bell<()>,
}

#[derive(Default)]
struct Ledger {
    pending: VecDeque<Deferred>,
    transferring: HashSet<PathBuf>,
    listing: HashSet<PathBuf>,
    flows: HashMap<PathBuf, Flow>,
    error: Option<Error>,
    peak: usize,
    done: bool,
}

impl Ledger {
    fn record(&mut self, error: &Error) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.transferring.is_empty() && self.listing.is_empty()
    }
}

/// Point-in-time view of a [`ProxyTransfer`]'s bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub pending: usize,
    pub transferring: usize,
    pub listing: usize,
    /// Most paths that were ever in `transferring` at once.
    pub peak_transferring: usize,
    pub error: Option<String>,
}

struct Inner<S: Resource, D: Resource> {
    source: S,
    destination: D,
    options: TransferOptions,
    control: Control,
    ledger: Mutex<Ledger>,
}

/// Generic tree transfer between any two resources.
pub struct ProxyTransfer<S: Resource, D: Resource> {
    inner: Arc<Inner<S, D>>,
}

impl<S: Resource, D: Resource> Clone for ProxyTransfer<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Resource, D: Resource> std::fmt::Debug for ProxyTransfer<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTransfer")
            .field("source", &self.inner.source)
            .field("destination", &self.inner.destination)
            .field("options", &self.inner.options)
            .field("ledger", &self.ledger())
            .finish()
    }
}

impl<S: Resource, D: Resource> ProxyTransfer<S, D> {
    pub fn new(source: S, destination: D, options: TransferOptions) -> Self {
        let inner = Arc::new(Inner {
            control: Control::new(&source, &destination),
            source,
            destination,
            options,
            ledger: Mutex::new(Ledger::default()),
        });
        let weak: Weak<Inner<S, D>> = Arc::downgrade(&inner);
        inner.control.stopped().on_always(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                match outcome {
                    Ok(()) => inner.halt(&Error::Cancelled),
                    Err(error) => inner.halt(error),
                }
            }
        });
        Self { inner }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.inner.options
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        let ledger = self.inner.ledger.lock();
        LedgerSnapshot {
            pending: ledger.pending.len(),
            transferring: ledger.transferring.len(),
            listing: ledger.listing.len(),
            peak_transferring: ledger.peak,
            error: ledger.error.as_ref().map(ToString::to_string),
        }
    }

    /// Transfers `path`, relative to the roots, as soon as a slot is free. The returned bell
    /// resolves when the path actually starts.
    pub fn transfer(&self, path: impl Into<PathBuf>) -> Bell<()> {
        self.inner.transfer(path.into())
    }
}

impl<S: Resource, D: Resource> Transfer for ProxyTransfer<S, D> {
    type Source = S;
    type Destination = D;

    fn source(&self) -> &S {
        &self.inner.source
    }

    fn destination(&self) -> &D {
        &self.inner.destination
    }

    fn control(&self) -> &Control {
        &self.inner.control
    }

    fn run(&self) {
        tracing::info!(
            "transferring {:?} -> {:?} with concurrency {}",
            self.inner.source.path(),
            self.inner.destination.path(),
            self.inner.options.concurrency()
        );
        if self.inner.source.is_singleton() {
            self.inner.transfer(PathBuf::new());
        } else {
            self.inner.expand_wildcard();
        }
    }
}

impl<S: Resource, D: Resource> Inner<S, D> {
    fn source_at(&self, path: &Path) -> S {
        if self.source.is_singleton() {
            return self.source.select(&resolve(self.source.path(), path));
        }
        let parent = self.source.path().parent().unwrap_or_else(|| Path::new("/"));
        self.source.select(&resolve(parent, path))
    }

    fn destination_at(&self, path: &Path) -> D {
        self.destination
            .select(&resolve(self.destination.path(), path))
    }

    fn is_done(&self) -> bool {
        self.ledger.lock().done
    }

    fn transfer(self: &Arc<Self>, path: PathBuf) -> Bell<()> {
        let dispatcher = self.control.dispatcher();
        let started = {
            let mut ledger = self.ledger.lock();
            if ledger.done {
                return Bell::failed(dispatcher, Error::msg("transfer already stopped"));
            }
            if ledger.transferring.len() >= self.options.concurrency() {
                tracing::debug!("deferring {:?}", path);
                let started = Bell::new(dispatcher);
                ledger.pending.push_back(Deferred {
                    path,
                    started: started.clone(),
                });
                return started;
            }
            ledger.transferring.insert(path.clone());
            ledger.peak = std::cmp::max(ledger.peak, ledger.transferring.len());
            Bell::resolved(dispatcher, ())
        };
        self.process(path);
        started
    }

    fn enqueue_child(self: &Arc<Self>, path: PathBuf) {
        {
            let mut ledger = self.ledger.lock();
            if ledger.done {
                return;
            }
            ledger.pending.push_front(Deferred {
                path,
                started: Bell::new(self.control.dispatcher()),
            });
        }
        self.pump();
    }

    /// Starts pending paths while slots are free.
    fn pump(self: &Arc<Self>) {
        let mut started = vec![];
        {
            let mut ledger = self.ledger.lock();
            while !ledger.done && ledger.transferring.len() < self.options.concurrency() {
                let Some(deferred) = ledger.pending.pop_front() else {
                    break;
                };
                ledger.transferring.insert(deferred.path.clone());
                ledger.peak = std::cmp::max(ledger.peak, ledger.transferring.len());
                started.push(deferred);
            }
        }
        for deferred in started {
            deferred.started.ring(());
            self.process(deferred.path);
        }
    }

    fn process(self: &Arc<Self>, path: PathBuf) {
        self.control.progress().ops.start();
        let source = self.source_at(&path);
        let inner = self.clone();
        source.stat().on_always(move |stat: &Result<Stat>| match stat {
            Err(error) => inner.settle_transfer(&path, Err(error.clone())),
            Ok(stat) if stat.dir => inner.make_directory(path, source, None),
            Ok(_) => inner.copy_file(path, source),
        });
    }

    /// Roots a wildcard transfer: the pattern's parent is listed and the matching children
    /// are transferred into the destination directory.
    fn expand_wildcard(self: &Arc<Self>) {
        let root = PathBuf::new();
        {
            let mut ledger = self.ledger.lock();
            ledger.transferring.insert(root.clone());
            ledger.peak = std::cmp::max(ledger.peak, ledger.transferring.len());
        }
        self.control.progress().ops.start();
        let listed = self.source_at(&root);
        self.make_directory(root, listed, Some(self.source.clone()));
    }

    fn make_directory(self: &Arc<Self>, path: PathBuf, listed: S, pattern: Option<S>) {
        if self.is_done() {
            self.settle_transfer(&path, Err(Error::Cancelled));
            return;
        }
        let tolerate_existing = self.options.overwrite || pattern.is_some();
        let inner = self.clone();
        self.destination_at(&path).mkdir().on_always(move |made| {
            let progress = inner.control.progress();
            match made {
                Ok(_) => progress.directories_created.inc(),
                Err(Error::AlreadyExists(_)) if tolerate_existing => {
                    tracing::debug!("reusing existing directory {:?}", path);
                    progress.directories_reused.inc();
                }
                Err(error) => {
                    inner.settle_transfer(&path, Err(error.clone()));
                    return;
                }
            }
            {
                let mut ledger = inner.ledger.lock();
                // listing is marked before the slot is released so the tree never looks idle
                ledger.listing.insert(path.clone());
                ledger.transferring.remove(&path);
            }
            inner.pump();
            let names = listed.list();
            inner.read_listing(path, names, pattern);
        });
    }

    fn read_listing(self: &Arc<Self>, path: PathBuf, names: Emitter<String>, pattern: Option<S>) {
        let inner = self.clone();
        names.next().on_always(move |next| match next {
            Ok(Some(name)) => {
                if inner.is_done() {
                    inner.settle_listing(&path, Ok(()));
                    return;
                }
                let wanted = match &pattern {
                    Some(pattern) => pattern.matches(name),
                    None => Ok(true),
                };
                match wanted {
                    Ok(true) => inner.enqueue_child(path.join(name)),
                    Ok(false) => tracing::debug!("skipping {:?}, does not match", name),
                    Err(error) => {
                        inner.settle_listing(&path, Err(error));
                        return;
                    }
                }
                inner.read_listing(path, names, pattern);
            }
            Ok(None) => inner.settle_listing(&path, Ok(())),
            Err(error) => inner.settle_listing(&path, Err(error.clone())),
        });
    }

    fn copy_file(self: &Arc<Self>, path: PathBuf, source: S) {
        if self.is_done() {
            self.settle_transfer(&path, Err(Error::Cancelled));
            return;
        }
        let destination = self.destination_at(&path);
        if self.options.overwrite {
            self.connect(path, source, destination);
            return;
        }
        let inner = self.clone();
        destination.stat().on_always(move |existing| match existing {
            Err(Error::NotFound(_)) => inner.connect(path, source, destination),
            Err(error) => inner.settle_transfer(&path, Err(error.clone())),
            Ok(_) => {
                let error = Error::AlreadyExists(format!(
                    "destination {:?}, did you intend to specify --overwrite?",
                    destination.path()
                ));
                inner.settle_transfer(&path, Err(error));
            }
        });
    }

    fn connect(self: &Arc<Self>, path: PathBuf, source: S, destination: D) {
        if self.is_done() {
            self.settle_transfer(&path, Err(Error::Cancelled));
            return;
        }
        let dispatcher = self.control.dispatcher();
        let monitor = MonitorPipe {
            progress: self.control.progress().clone(),
        };
        let flow = Pipeline::from_tap(dispatcher, source.tap())
            .through(monitor)
            .and_then(|pipeline| {
                pipeline.attach(Pipeline::from_sink(dispatcher, destination.sink()))
            })
            .and_then(|pipeline| pipeline.start());
        let flow = match flow {
            Ok(flow) => flow,
            Err(error) => {
                self.settle_transfer(&path, Err(error));
                return;
            }
        };
        let stopped = {
            let mut ledger = self.ledger.lock();
            ledger.flows.insert(path.clone(), flow.clone());
            ledger.done
        };
        if stopped {
            flow.abort(Error::Cancelled);
        }
        let inner = self.clone();
        flow.done().on_always(move |copied| {
            if copied.is_ok() {
                inner.control.progress().files_transferred.inc();
            }
            inner.settle_transfer(&path, copied.clone());
        });
    }

    fn settle_transfer(self: &Arc<Self>, path: &Path, outcome: Result<()>) {
        {
            let mut ledger = self.ledger.lock();
            ledger.transferring.remove(path);
            ledger.flows.remove(path);
        }
        self.settle(path, outcome);
    }

    fn settle_listing(self: &Arc<Self>, path: &Path, outcome: Result<()>) {
        self.ledger.lock().listing.remove(path);
        self.settle(path, outcome);
    }

    fn settle(self: &Arc<Self>, path: &Path, outcome: Result<()>) {
        self.control.progress().ops.finish();
        if let Err(error) = &outcome {
            let (halted, fail_now) = {
                let mut ledger = self.ledger.lock();
                let halted = ledger.done;
                if !halted {
                    ledger.record(error);
                }
                let fail_now = !halted && self.options.fail_early;
                if fail_now {
                    ledger.done = true;
                }
                (halted, fail_now)
            };
            if halted {
                tracing::debug!("{:?} stopped: {}", path, error);
            } else {
                tracing::error!("failed transferring {:?}: {}", path, error);
                self.control.progress().errors.inc();
            }
            if fail_now {
                self.control.end(Err(error.clone()));
                return;
            }
        } else {
            tracing::debug!("finished {:?}", path);
        }
        self.pump();
        self.complete_if_idle();
    }

    fn complete_if_idle(&self) {
        let outcome = {
            let mut ledger = self.ledger.lock();
            if ledger.done || !ledger.is_idle() {
                return;
            }
            ledger.done = true;
            match &ledger.error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        };
        self.control.end(outcome);
    }

    /// Stops everything still running after the transfer stopped with `error`.
    fn halt(&self, error: &Error) {
        let (pending, flows) = {
            let mut ledger = self.ledger.lock();
            ledger.done = true;
            let pending: Vec<_> = ledger.pending.drain(..).collect();
            let flows: Vec<_> = ledger.flows.values().cloned().collect();
            (pending, flows)
        };
        if !pending.is_empty() || !flows.is_empty() {
            tracing::debug!(
                "stopping {} pending and {} running path(s): {}",
                pending.len(),
                flows.len(),
                error
            );
        }
        for deferred in pending {
            deferred.started.ring_err(error.clone());
        }
        for flow in flows {
            flow.abort(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, ManualExecutor};
    use crate::memory::{MemoryResource, MemoryStore, MemorySession, Op};
    use crate::resource::Session;
    use tracing_test::traced_test;

    fn manual() -> (Arc<ManualExecutor>, Dispatcher) {
        let executor = ManualExecutor::new();
        let dispatcher = executor.dispatcher();
        (executor, dispatcher)
    }

    /// `{a (10 bytes), b/ {c (20 bytes), d (30 bytes)}}` under /src.
    fn sample_tree(name: &str) -> Result<MemoryStore> {
        let store = MemoryStore::new(name)?;
        store.add_file("/src/a", vec![b'a'; 10]);
        store.add_file("/src/b/c", vec![b'c'; 20]);
        store.add_file("/src/b/d", vec![b'd'; 30]);
        Ok(store)
    }

    fn proxy(
        session: &Arc<MemorySession>,
        source: &str,
        destination: &str,
        options: TransferOptions,
    ) -> ProxyTransfer<MemoryResource, MemoryResource> {
        ProxyTransfer::new(
            session.select(Path::new(source)),
            session.select(Path::new(destination)),
            options,
        )
    }

    fn size(store: &MemoryStore, path: &str) -> Option<usize> {
        store.read(path).map(|data| data.len())
    }

    #[test]
    #[traced_test]
    fn tree_is_copied_completely() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("tree")?;
        let session = store.session(&dispatcher);
        let transfer = proxy(
            &session,
            "/src",
            "/dst",
            TransferOptions::default().with_concurrency(2),
        );
        transfer.start();
        executor.run_until_idle();
        assert!(transfer.on_stop().is_done(), "{:?}", transfer.on_stop());
        assert!(store.is_dir("/dst/b"));
        assert_eq!(size(&store, "/dst/a"), Some(10));
        assert_eq!(size(&store, "/dst/b/c"), Some(20));
        assert_eq!(size(&store, "/dst/b/d"), Some(30));
        let summary = transfer.summary();
        assert_eq!(summary.bytes_transferred, 60);
        assert_eq!(summary.files_transferred, 3);
        assert_eq!(summary.directories_created, 2);
        assert_eq!(summary.errors, 0);
        let ledger = transfer.ledger();
        assert_eq!((ledger.pending, ledger.transferring, ledger.listing), (0, 0, 0));
        assert!(ledger.peak_transferring <= 2);
        assert_eq!(store.transfers_done(), 2);
        Ok(())
    }

    #[test]
    fn concurrency_bounds_simultaneous_transfers() -> Result<()> {
        for concurrency in [1, 2, 3] {
            let (executor, dispatcher) = manual();
            let store = MemoryStore::new("wide")?;
            for i in 0..8 {
                store.add_file(format!("/src/f{i}"), vec![0u8; 16]);
            }
            store.add_file("/src/sub/g", vec![0u8; 16]);
            let session = store.session(&dispatcher);
            let transfer = proxy(
                &session,
                "/src",
                "/dst",
                TransferOptions::default().with_concurrency(concurrency),
            );
            transfer.start();
            executor.run_until_idle();
            assert!(transfer.on_stop().is_done());
            assert!(transfer.ledger().peak_transferring <= concurrency);
            assert!(store.peak_open_sinks() <= concurrency);
            assert_eq!(transfer.summary().files_transferred, 9);
        }
        Ok(())
    }

    #[test]
    fn deferred_requests_start_when_slots_free_up() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("deferred")?;
        store.add_dir("/dst");
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src", "/dst", TransferOptions::default());
        transfer.control().begin();
        let first = transfer.transfer("a");
        let second = transfer.transfer("b");
        assert!(first.is_done());
        assert!(!second.is_resolved());
        assert_eq!(transfer.ledger().pending, 1);
        executor.run_until_idle();
        assert!(second.is_done());
        assert!(transfer.on_stop().is_done());
        assert_eq!(size(&store, "/dst/b/d"), Some(30));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn failure_is_isolated_to_its_branch() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("isolated")?;
        store.fail("/src/b/c", Op::Tap, Error::NotFound("/src/b/c".into()));
        let session = store.session(&dispatcher);
        let transfer = proxy(
            &session,
            "/src",
            "/dst",
            TransferOptions::default().with_concurrency(2),
        );
        transfer.start();
        executor.run_until_idle();
        assert!(matches!(
            transfer.on_stop().outcome(),
            Some(Err(Error::NotFound(_)))
        ));
        assert_eq!(size(&store, "/dst/a"), Some(10));
        assert_eq!(size(&store, "/dst/b/d"), Some(30));
        assert!(!store.exists("/dst/b/c"));
        assert_eq!(transfer.summary().errors, 1);
        assert!(logs_contain("failed transferring"));
        Ok(())
    }

    #[test]
    fn first_error_wins() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("first")?;
        store.fail("/src/a", Op::Stat, Error::PermissionDenied("/src/a".into()));
        store.fail("/src/b", Op::List, Error::Timeout);
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src", "/dst", TransferOptions::default());
        transfer.start();
        executor.run_until_idle();
        let ledger = transfer.ledger();
        let recorded = ledger.error.ok_or_else(|| Error::msg("no error recorded"))?;
        let outcome = transfer
            .on_stop()
            .outcome()
            .ok_or_else(|| Error::msg("transfer still running"))?;
        assert_eq!(outcome.err().map(|error| error.to_string()), Some(recorded));
        assert_eq!(transfer.summary().errors, 2);
        Ok(())
    }

    #[test]
    fn cancel_finishes_in_flight_sink_once() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("cancel")?;
        store.stall("/dst/a", Op::Drain);
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src", "/dst", TransferOptions::default());
        transfer.start();
        executor.run_until_idle();
        assert!(!transfer.on_stop().is_resolved());
        assert_eq!(transfer.ledger().transferring, 1);
        assert!(transfer.cancel());
        executor.run_until_idle();
        assert!(matches!(
            transfer.on_stop().outcome(),
            Some(Err(Error::Cancelled))
        ));
        let finishes = store.finishes("/dst/a");
        assert_eq!(finishes.len(), 1);
        assert!(matches!(finishes[0], Err(Error::Cancelled)));
        // nothing queued behind the stalled file was started
        assert!(!store.exists("/dst/b/c"));
        assert!(!store.exists("/dst/b/d"));
        Ok(())
    }

    #[test]
    fn stop_halts_running_transfer() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("stop")?;
        store.stall("/dst/a", Op::Drain);
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src", "/dst", TransferOptions::default());
        transfer.start();
        executor.run_until_idle();
        assert_eq!(transfer.ledger().transferring, 1);
        assert!(transfer.stop());
        executor.run_until_idle();
        assert!(transfer.on_stop().is_done());
        let finishes = store.finishes("/dst/a");
        assert_eq!(finishes.len(), 1);
        assert!(matches!(finishes[0], Err(Error::Cancelled)));
        assert!(!store.exists("/dst/b/c"));
        assert!(!store.exists("/dst/b/d"));
        let ledger = transfer.ledger();
        assert_eq!((ledger.pending, ledger.transferring), (0, 0));
        assert_eq!(transfer.summary().errors, 0);
        assert_eq!(store.transfers_done(), 2);
        Ok(())
    }

    #[test]
    fn stop_right_after_start_copies_nothing() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("stop-early")?;
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src", "/dst", TransferOptions::default());
        transfer.start();
        assert!(transfer.stop());
        executor.run_until_idle();
        assert!(transfer.on_stop().is_done());
        assert!(!store.exists("/dst/a"));
        assert!(!store.exists("/dst/b/d"));
        assert_eq!(transfer.summary().files_transferred, 0);
        Ok(())
    }

    #[test]
    fn existing_destination_file_needs_overwrite() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = MemoryStore::new("file-overwrite")?;
        store.add_file("/src/a", vec![b'a'; 10]);
        store.add_file("/dst/a", &b"old"[..]);
        let session = store.session(&dispatcher);
        let refused = proxy(&session, "/src/a", "/dst/a", TransferOptions::default());
        refused.start();
        executor.run_until_idle();
        assert!(matches!(
            refused.on_stop().outcome(),
            Some(Err(Error::AlreadyExists(_)))
        ));
        assert_eq!(store.read("/dst/a").as_deref(), Some(&b"old"[..]));
        assert!(store.finishes("/dst/a").is_empty());
        let replaced = proxy(
            &session,
            "/src/a",
            "/dst/a",
            TransferOptions::default().with_overwrite(true),
        );
        replaced.start();
        executor.run_until_idle();
        assert!(replaced.on_stop().is_done());
        assert_eq!(size(&store, "/dst/a"), Some(10));
        Ok(())
    }

    #[test]
    fn fail_early_stops_siblings() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = MemoryStore::new("fail-early")?;
        store.add_file("/src/a", vec![b'a'; 10]);
        store.add_file("/src/b", vec![b'b'; 10]);
        store.stall("/dst/a", Op::Drain);
        store.fail("/dst/b", Op::Sink, Error::PermissionDenied("/dst/b".into()));
        let session = store.session(&dispatcher);
        let transfer = proxy(
            &session,
            "/src",
            "/dst",
            TransferOptions::default()
                .with_concurrency(2)
                .with_fail_early(true),
        );
        transfer.start();
        executor.run_until_idle();
        assert!(matches!(
            transfer.on_stop().outcome(),
            Some(Err(Error::PermissionDenied(_)))
        ));
        let stalled = store.finishes("/dst/a");
        assert_eq!(stalled.len(), 1);
        assert!(matches!(stalled[0], Err(Error::PermissionDenied(_))));
        assert!(!store.exists("/dst/a"));
        assert_eq!(transfer.summary().errors, 1);
        Ok(())
    }

    #[test]
    fn existing_destination_directory_needs_overwrite() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("overwrite")?;
        store.add_dir("/dst/b");
        let session = store.session(&dispatcher);
        let refused = proxy(&session, "/src", "/dst", TransferOptions::default());
        refused.start();
        executor.run_until_idle();
        assert!(matches!(
            refused.on_stop().outcome(),
            Some(Err(Error::AlreadyExists(_)))
        ));
        let store = sample_tree("overwrite-on")?;
        store.add_dir("/dst/b");
        let session = store.session(&dispatcher);
        let accepted = proxy(
            &session,
            "/src",
            "/dst",
            TransferOptions::default().with_overwrite(true),
        );
        accepted.start();
        executor.run_until_idle();
        assert!(accepted.on_stop().is_done());
        assert_eq!(accepted.summary().directories_reused, 2);
        assert_eq!(size(&store, "/dst/b/c"), Some(20));
        Ok(())
    }

    #[test]
    fn wildcard_transfers_only_matching_names() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = MemoryStore::new("wildcard")?;
        store.add_file("/src/one.txt", &b"1"[..]);
        store.add_file("/src/two.txt", &b"22"[..]);
        store.add_file("/src/skip.csv", &b"333"[..]);
        let session = store.session(&dispatcher);
        let transfer = proxy(&session, "/src/*.txt", "/dst", TransferOptions::default());
        transfer.start();
        executor.run_until_idle();
        assert!(transfer.on_stop().is_done());
        assert_eq!(size(&store, "/dst/one.txt"), Some(1));
        assert_eq!(size(&store, "/dst/two.txt"), Some(2));
        assert!(!store.exists("/dst/skip.csv"));
        assert_eq!(transfer.summary().bytes_transferred, 3);
        Ok(())
    }

    #[test]
    fn single_file_and_missing_source() -> Result<()> {
        let (executor, dispatcher) = manual();
        let store = sample_tree("single")?;
        let session = store.session(&dispatcher);
        let file = proxy(&session, "/src/b/d", "/copy", TransferOptions::default());
        let missing = proxy(&session, "/nope", "/never", TransferOptions::default());
        file.start();
        missing.start();
        executor.run_until_idle();
        assert!(file.on_stop().is_done());
        assert_eq!(size(&store, "/copy"), Some(30));
        assert!(matches!(
            missing.on_stop().outcome(),
            Some(Err(Error::NotFound(_)))
        ));
        assert!(!store.exists("/never"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn transfer_to_on_tokio_dispatcher() -> anyhow::Result<()> {
        let store = sample_tree("tokio")?;
        let session = store.session(&Dispatcher::current()?);
        let transfer = session.select(Path::new("/src")).transfer_to(
            &session.select(Path::new("/dst")),
            TransferOptions::default().with_concurrency(2),
        );
        transfer.start();
        let summary = crate::transfer::finished(transfer.as_ref()).await?;
        assert_eq!(summary.bytes_transferred, 60);
        assert_eq!(size(&store, "/dst/b/c"), Some(20));
        Ok(())
    }
}
