//! Backpressured streaming pipelines.
//!
//! A pipeline moves [`Slice`]s from one [`Tap`] through zero or more [`Pipe`] stages into one
//! [`Sink`]. Stages never talk to each other directly: every stage is fed through an
//! [`Outlet`], which serializes drains, refuses data after the stream was finished and makes
//! sure each stage is finished exactly once, whatever failed where.
//!
//! ```text
//!   Tap --drain--> [Outlet] Pipe --drain--> [Outlet] Pipe --drain--> [Outlet] Sink
//! ```
//!
//! The [`Pipeline`] container owns all stages. Stages hold no references to their neighbors;
//! the links between them are built when the pipeline is started.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::slice::Slice;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Source end of a pipeline.
pub trait Tap: Send + Sync + 'static {
    /// Begin emitting into `outlet` once `ready` has resolved successfully.
    ///
    /// The tap should wait for the bell returned by each [`Outlet::drain`] before issuing the
    /// next one and must end the stream with [`Outlet::finish`]. If `ready` fails the outlet
    /// is finished by the pipeline; the tap only needs to release what it holds.
    fn start(&self, ready: Bell<()>, outlet: Outlet);
}

/// Destination end of a pipeline.
pub trait Sink: Send + Sync + 'static {
    /// Resolves once the sink can accept data; this is the pipeline's ready signal.
    fn start(&self) -> Bell<()>;
    /// Accepts one slice. The returned bell resolving means the sink is ready for the next.
    fn drain(&self, slice: Slice) -> Bell<()>;
    /// Ends the stream, `Err` meaning the data is incomplete. The returned bell settles once
    /// the sink released its resources. Called exactly once.
    fn finish(&self, outcome: Result<()>) -> Bell<()>;
}

/// Intermediate stage. The defaults forward everything unchanged.
pub trait Pipe: Send + Sync + 'static {
    /// `None` means the stage is ready as soon as everything downstream is.
    fn start(&self) -> Option<Bell<()>> {
        None
    }

    fn drain(&self, slice: Slice, next: &Outlet) -> Bell<()> {
        next.drain(slice)
    }

    fn finish(&self, outcome: Result<()>, next: &Outlet) -> Bell<()> {
        next.finish(outcome)
    }
}

enum Stage {
    Pipe { pipe: Arc<dyn Pipe>, next: Outlet },
    Sink(Arc<dyn Sink>),
}

struct LinkState {
    // settles when the most recent drain has been accepted downstream
    last: Bell<()>,
    finishing: bool,
    // no slice reaches the stage once this is set
    closed: bool,
    delivering: bool,
    deferred: Option<(Result<()>, Bell<()>)>,
}

struct Link {
    dispatcher: Dispatcher,
    stage: Stage,
    state: Mutex<LinkState>,
    finished: Bell<()>,
    done: Bell<()>,
}

/// Entry point into one pipeline stage.
#[derive(Clone)]
pub struct Outlet {
    link: Arc<Link>,
}

impl std::fmt::Debug for Outlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.link.state.lock();
        f.debug_struct("Outlet")
            .field("finishing", &state.finishing)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Outlet {
    fn new(dispatcher: &Dispatcher, stage: Stage, done: &Bell<()>) -> Self {
        Self {
            link: Arc::new(Link {
                dispatcher: dispatcher.clone(),
                stage,
                state: Mutex::new(LinkState {
                    last: Bell::resolved(dispatcher, ()),
                    finishing: false,
                    closed: false,
                    delivering: false,
                    deferred: None,
                }),
                finished: Bell::new(dispatcher),
                done: done.clone(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.link.dispatcher
    }

    /// Hands `slice` to the stage after every previously drained slice has been accepted.
    ///
    /// The returned bell resolves when the stage is ready for more. It fails if the outlet was
    /// already finished; a failed drain finishes the outlet with the same error.
    pub fn drain(&self, slice: Slice) -> Bell<()> {
        let accepted = {
            let mut state = self.link.state.lock();
            if state.finishing {
                return Bell::failed(
                    &self.link.dispatcher,
                    Error::msg("drain called after finish"),
                );
            }
            let link = self.link.clone();
            let accepted = state.last.and_then(move |()| link.deliver(slice));
            state.last = accepted.clone();
            accepted
        };
        let outlet = self.clone();
        accepted.on_fail(move |error| {
            outlet.abandon(error.clone());
        });
        accepted
    }

    /// Ends the stream. On success the finish waits for the last pending drain; on failure
    /// pending drains are abandoned. Only the first call has an effect; the returned bell
    /// settles once the stage finished.
    pub fn finish(&self, outcome: Result<()>) -> Bell<()> {
        if !self.begin_finish(false) {
            return self.link.finished.clone();
        }
        self.settle(outcome);
        self.link.finished.clone()
    }

    /// Whether [`finish`](Self::finish) was called, or a drain failed.
    pub fn is_finished(&self) -> bool {
        self.link.state.lock().finishing
    }

    // finish triggered by a failed drain
    fn abandon(&self, error: Error) {
        if self.begin_finish(true) {
            self.settle(Err(error));
        }
    }

    fn begin_finish(&self, quiet: bool) -> bool {
        let mut state = self.link.state.lock();
        if state.finishing {
            if !quiet {
                tracing::debug!("pipeline stage finished more than once, ignoring");
            }
            return false;
        }
        state.finishing = true;
        true
    }

    fn settle(&self, outcome: Result<()>) {
        let last = self.link.state.lock().last.clone();
        match outcome {
            Ok(()) => {
                let link = self.link.clone();
                last.on_always(move |drained| {
                    link.close(drained.clone());
                });
            }
            Err(error) => {
                last.cancel();
                self.link.close(Err(error));
            }
        }
    }
}

impl Link {
    fn deliver(&self, slice: Slice) -> Bell<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Bell::failed(&self.dispatcher, Error::Cancelled);
            }
            state.delivering = true;
        }
        let accepted = match &self.stage {
            Stage::Pipe { pipe, next } => pipe.drain(slice, next),
            Stage::Sink(sink) => sink.drain(slice),
        };
        let deferred = {
            let mut state = self.state.lock();
            state.delivering = false;
            state.deferred.take()
        };
        if let Some((outcome, finished)) = deferred {
            self.propagate(outcome).promise(&finished);
        }
        accepted
    }

    fn close(&self, outcome: Result<()>) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            if state.delivering {
                // the slice being handed over right now goes first
                state.deferred = Some((outcome, self.finished.clone()));
                return;
            }
        }
        self.propagate(outcome).promise(&self.finished);
    }

    fn propagate(&self, outcome: Result<()>) -> Bell<()> {
        match &self.stage {
            Stage::Pipe { pipe, next } => pipe.finish(outcome, next),
            Stage::Sink(sink) => {
                let released = sink.finish(outcome.clone());
                let done = self.done.clone();
                released.on_always(move |result| {
                    done.ring_result(outcome.and(result.clone()));
                });
                released
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Neither end is present, only intermediate stages.
    Ambiguous,
    TapTerminated,
    SinkTerminated,
    Connected,
}

/// A started pipeline.
#[derive(Debug, Clone)]
pub struct Flow {
    ready: Bell<()>,
    head: Outlet,
    done: Bell<()>,
}

impl Flow {
    /// Resolves once every stage downstream of the tap is ready.
    pub fn ready(&self) -> &Bell<()> {
        &self.ready
    }

    /// Settles after the sink finished, with the stream's outcome.
    pub fn done(&self) -> &Bell<()> {
        &self.done
    }

    /// Stops the stream: the tap is not started if it has not been yet, and every stage is
    /// finished with `error`.
    pub fn abort(&self, error: Error) {
        self.ready.ring_err(error.clone());
        self.head.finish(Err(error));
    }
}

/// Owns the stages of one pipeline.
pub struct Pipeline {
    dispatcher: Dispatcher,
    tap: Option<Arc<dyn Tap>>,
    pipes: Vec<Arc<dyn Pipe>>,
    sink: Option<Arc<dyn Sink>>,
    flow: OnceLock<Flow>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("orientation", &self.orientation())
            .field("pipes", &self.pipes.len())
            .field("started", &self.flow.get().is_some())
            .finish()
    }
}

impl Pipeline {
    fn empty(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            tap: None,
            pipes: vec![],
            sink: None,
            flow: OnceLock::new(),
        }
    }

    pub fn from_tap(dispatcher: &Dispatcher, tap: impl Tap) -> Self {
        Self {
            tap: Some(Arc::new(tap)),
            ..Self::empty(dispatcher)
        }
    }

    pub fn from_pipe(dispatcher: &Dispatcher, pipe: impl Pipe) -> Self {
        Self {
            pipes: vec![Arc::new(pipe)],
            ..Self::empty(dispatcher)
        }
    }

    pub fn from_sink(dispatcher: &Dispatcher, sink: impl Sink) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
            ..Self::empty(dispatcher)
        }
    }

    pub fn orientation(&self) -> Orientation {
        match (self.tap.is_some(), self.sink.is_some()) {
            (true, true) => Orientation::Connected,
            (true, false) => Orientation::TapTerminated,
            (false, true) => Orientation::SinkTerminated,
            (false, false) => Orientation::Ambiguous,
        }
    }

    pub fn is_started(&self) -> bool {
        self.flow.get().is_some()
    }

    /// Joins two partial pipelines. The side holding the tap (or lacking the sink) ends up
    /// upstream; two ambiguous pipelines are joined in argument order.
    pub fn attach(self, other: Pipeline) -> Result<Pipeline> {
        if self.is_started() || other.is_started() {
            return Err(Error::msg("cannot attach a started pipeline"));
        }
        use Orientation::*;
        let (upstream, downstream) = match (self.orientation(), other.orientation()) {
            (Connected, _) | (_, Connected) => {
                return Err(Error::msg("cannot attach to a connected pipeline"));
            }
            (TapTerminated, TapTerminated) => {
                return Err(Error::msg("cannot attach two taps"));
            }
            (SinkTerminated, SinkTerminated) => {
                return Err(Error::msg("cannot attach two sinks"));
            }
            (TapTerminated, _) | (Ambiguous, SinkTerminated) | (Ambiguous, Ambiguous) => {
                (self, other)
            }
            (SinkTerminated, _) | (Ambiguous, TapTerminated) => (other, self),
        };
        let mut pipes = upstream.pipes;
        pipes.extend(downstream.pipes);
        Ok(Pipeline {
            dispatcher: upstream.dispatcher,
            tap: upstream.tap,
            pipes,
            sink: downstream.sink,
            flow: OnceLock::new(),
        })
    }

    /// Appends `pipe` on the sink side of the existing stages.
    pub fn through(self, pipe: impl Pipe) -> Result<Pipeline> {
        if self.sink.is_some() {
            let dispatcher = self.dispatcher.clone();
            return Pipeline::from_pipe(&dispatcher, pipe).attach(self);
        }
        let dispatcher = self.dispatcher.clone();
        self.attach(Pipeline::from_pipe(&dispatcher, pipe))
    }

    /// Starts a connected pipeline. The sink is started first, then each pipe from the sink
    /// towards the tap, and the tap is handed the combined ready signal. Calling this again
    /// returns the same flow.
    pub fn start(&self) -> Result<Flow> {
        if let Some(flow) = self.flow.get() {
            return Ok(flow.clone());
        }
        let (Some(tap), Some(sink)) = (&self.tap, &self.sink) else {
            return Err(Error::msg(format!(
                "cannot start a pipeline that is not connected: {:?}",
                self.orientation()
            )));
        };
        let flow = self.flow.get_or_init(|| {
            let dispatcher = &self.dispatcher;
            let done = Bell::new(dispatcher);
            let mut ready = sink.start();
            let mut head = Outlet::new(dispatcher, Stage::Sink(sink.clone()), &done);
            for pipe in self.pipes.iter().rev() {
                let next = head;
                head = Outlet::new(
                    dispatcher,
                    Stage::Pipe {
                        pipe: pipe.clone(),
                        next,
                    },
                    &done,
                );
                let pipe = pipe.clone();
                let dispatcher = dispatcher.clone();
                ready = ready.and_then(move |()| {
                    pipe.start()
                        .unwrap_or_else(|| Bell::resolved(&dispatcher, ()))
                });
            }
            // abort rings this one, never a bell handed out by a stage
            let ready = {
                let owned = Bell::new(dispatcher);
                ready.promise(&owned);
                owned
            };
            {
                let head = head.clone();
                ready.on_fail(move |error| {
                    head.abandon(error.clone());
                });
            }
            tracing::debug!("starting pipeline with {} pipe(s)", self.pipes.len());
            tap.start(ready.clone(), head.clone());
            Flow { ready, head, done }
        });
        Ok(flow.clone())
    }
}

/// Tap emitting an in-memory buffer in fixed-size slices.
#[derive(Debug, Clone)]
pub struct BytesTap {
    data: bytes::Bytes,
    chunk_size: usize,
}

impl BytesTap {
    pub fn new(data: impl Into<bytes::Bytes>, chunk_size: usize) -> Self {
        Self {
            data: data.into(),
            chunk_size: std::cmp::max(1, chunk_size),
        }
    }
}

impl Tap for BytesTap {
    fn start(&self, ready: Bell<()>, outlet: Outlet) {
        let data = self.data.clone();
        let chunk_size = self.chunk_size;
        ready.on_done(move |()| emit_chunks(outlet, data, 0, chunk_size));
    }
}

fn emit_chunks(outlet: Outlet, data: bytes::Bytes, offset: usize, chunk_size: usize) {
    if offset >= data.len() {
        outlet.finish(Ok(()));
        return;
    }
    let end = std::cmp::min(offset + chunk_size, data.len());
    let slice = Slice::new(data.slice(offset..end), offset as u64);
    let accepted = outlet.drain(slice);
    accepted.on_done(move |()| emit_chunks(outlet, data, end, chunk_size));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualExecutor;

    #[derive(Default)]
    struct Recorded {
        slices: Vec<Slice>,
        finishes: Vec<Result<()>>,
        drained_after_finish: bool,
    }

    /// Sink that records everything and lets the test decide when each drain is accepted.
    #[derive(Clone)]
    struct RecordingSink {
        dispatcher: Dispatcher,
        recorded: Arc<Mutex<Recorded>>,
        start: Bell<()>,
        accepts: Arc<Mutex<Vec<Bell<()>>>>,
        manual_accept: bool,
        fail_at: Option<usize>,
    }

    impl RecordingSink {
        fn new(dispatcher: &Dispatcher) -> Self {
            Self {
                dispatcher: dispatcher.clone(),
                recorded: Arc::default(),
                start: Bell::resolved(dispatcher, ()),
                accepts: Arc::default(),
                manual_accept: false,
                fail_at: None,
            }
        }

        fn bytes(&self) -> Vec<u8> {
            let recorded = self.recorded.lock();
            recorded
                .slices
                .iter()
                .flat_map(|slice| slice.bytes().to_vec())
                .collect()
        }
    }

    impl Sink for RecordingSink {
        fn start(&self) -> Bell<()> {
            self.start.clone()
        }

        fn drain(&self, slice: Slice) -> Bell<()> {
            let index = {
                let mut recorded = self.recorded.lock();
                if !recorded.finishes.is_empty() {
                    recorded.drained_after_finish = true;
                }
                recorded.slices.push(slice);
                recorded.slices.len() - 1
            };
            if self.fail_at == Some(index) {
                return Bell::failed(&self.dispatcher, Error::PermissionDenied("disk".into()));
            }
            if !self.manual_accept {
                return Bell::resolved(&self.dispatcher, ());
            }
            let accept = Bell::new(&self.dispatcher);
            self.accepts.lock().push(accept.clone());
            accept
        }

        fn finish(&self, outcome: Result<()>) -> Bell<()> {
            self.recorded.lock().finishes.push(outcome);
            Bell::resolved(&self.dispatcher, ())
        }
    }

    /// Tap that drains all of its slices without waiting in between.
    struct EagerTap {
        slices: Vec<&'static [u8]>,
        finish_immediately: bool,
    }

    impl Tap for EagerTap {
        fn start(&self, ready: Bell<()>, outlet: Outlet) {
            let slices = self.slices.clone();
            let finish_immediately = self.finish_immediately;
            ready.on_done(move |()| {
                let mut offset = 0;
                let mut last = None;
                for data in slices {
                    last = Some(outlet.drain(Slice::new(data, offset)));
                    offset += data.len() as u64;
                }
                if finish_immediately {
                    outlet.finish(Ok(()));
                } else if let Some(last) = last {
                    let outlet = outlet.clone();
                    last.on_done(move |()| {
                        outlet.finish(Ok(()));
                    });
                }
            });
        }
    }

    struct Upper;

    impl Pipe for Upper {
        fn drain(&self, slice: Slice, next: &Outlet) -> Bell<()> {
            let offset = slice.offset();
            next.drain(Slice::new(slice.bytes().to_ascii_uppercase(), offset))
        }
    }

    fn manual() -> (Arc<ManualExecutor>, Dispatcher) {
        let executor = ManualExecutor::new();
        let dispatcher = executor.dispatcher();
        (executor, dispatcher)
    }

    #[test]
    fn orientation_and_attach_rules() -> Result<()> {
        let (_executor, dispatcher) = manual();
        let tap = || BytesTap::new(&b"abc"[..], 1);
        let sink = || RecordingSink::new(&dispatcher);
        assert_eq!(
            Pipeline::from_pipe(&dispatcher, Upper).orientation(),
            Orientation::Ambiguous
        );
        let half = Pipeline::from_pipe(&dispatcher, Upper)
            .attach(Pipeline::from_sink(&dispatcher, sink()))?;
        assert_eq!(half.orientation(), Orientation::SinkTerminated);
        let full = Pipeline::from_tap(&dispatcher, tap()).attach(half)?;
        assert_eq!(full.orientation(), Orientation::Connected);
        assert!(full.attach(Pipeline::from_pipe(&dispatcher, Upper)).is_err());
        assert!(Pipeline::from_tap(&dispatcher, tap())
            .attach(Pipeline::from_tap(&dispatcher, tap()))
            .is_err());
        assert!(Pipeline::from_sink(&dispatcher, sink())
            .attach(Pipeline::from_sink(&dispatcher, sink()))
            .is_err());
        // sink side first still ends up downstream
        let reversed = Pipeline::from_sink(&dispatcher, sink())
            .attach(Pipeline::from_tap(&dispatcher, tap()))?;
        assert_eq!(reversed.orientation(), Orientation::Connected);
        assert!(Pipeline::from_tap(&dispatcher, tap()).start().is_err());
        Ok(())
    }

    #[test]
    fn eager_drains_arrive_in_order_before_finish() -> Result<()> {
        let (executor, dispatcher) = manual();
        let mut sink = RecordingSink::new(&dispatcher);
        sink.manual_accept = true;
        let tap = EagerTap {
            slices: vec![b"s1", b"s2", b"s3"],
            finish_immediately: true,
        };
        let pipeline = Pipeline::from_tap(&dispatcher, tap)
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        executor.run_until_idle();
        // only the first slice is handed over until the sink accepts it
        assert_eq!(sink.recorded.lock().slices.len(), 1);
        for expected in 1..=3 {
            let accept = sink.accepts.lock().get(expected - 1).cloned();
            assert!(sink.recorded.lock().finishes.is_empty());
            if let Some(accept) = accept {
                accept.ring(());
            }
            executor.run_until_idle();
        }
        assert_eq!(sink.bytes(), b"s1s2s3".to_vec());
        let recorded = sink.recorded.lock();
        assert_eq!(recorded.finishes.len(), 1);
        assert!(recorded.finishes[0].is_ok());
        assert!(!recorded.drained_after_finish);
        assert!(flow.done().is_done());
        Ok(())
    }

    #[test]
    fn pipes_transform_in_order_and_start_is_idempotent() -> Result<()> {
        let (executor, dispatcher) = manual();
        let sink = RecordingSink::new(&dispatcher);
        let pipeline = Pipeline::from_tap(&dispatcher, BytesTap::new(&b"hello world"[..], 4))
            .through(Upper)?
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        let again = pipeline.start()?;
        executor.run_until_idle();
        assert_eq!(sink.bytes(), b"HELLO WORLD".to_vec());
        let offsets: Vec<_> = sink
            .recorded
            .lock()
            .slices
            .iter()
            .map(Slice::offset)
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert!(flow.done().is_done());
        assert!(again.done().is_done());
        assert_eq!(sink.recorded.lock().finishes.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_drain_finishes_every_stage_once() -> Result<()> {
        let (executor, dispatcher) = manual();
        let mut sink = RecordingSink::new(&dispatcher);
        sink.fail_at = Some(1);
        let finishes = Arc::new(Mutex::new(0));
        struct Counting(Arc<Mutex<usize>>);
        impl Pipe for Counting {
            fn finish(&self, outcome: Result<()>, next: &Outlet) -> Bell<()> {
                *self.0.lock() += 1;
                next.finish(outcome)
            }
        }
        let pipeline = Pipeline::from_tap(&dispatcher, BytesTap::new(&b"aabbcc"[..], 2))
            .through(Counting(finishes.clone()))?
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        executor.run_until_idle();
        assert_eq!(*finishes.lock(), 1);
        let recorded = sink.recorded.lock();
        assert_eq!(recorded.slices.len(), 2);
        assert_eq!(recorded.finishes.len(), 1);
        assert!(matches!(recorded.finishes[0], Err(Error::PermissionDenied(_))));
        assert!(matches!(flow.done().outcome(), Some(Err(Error::PermissionDenied(_)))));
        Ok(())
    }

    #[test]
    fn failed_start_finishes_sink_without_data() -> Result<()> {
        let (executor, dispatcher) = manual();
        let mut sink = RecordingSink::new(&dispatcher);
        sink.start = Bell::failed(&dispatcher, Error::NotFound("target".into()));
        let pipeline = Pipeline::from_tap(&dispatcher, BytesTap::new(&b"data"[..], 2))
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        executor.run_until_idle();
        let recorded = sink.recorded.lock();
        assert!(recorded.slices.is_empty());
        assert_eq!(recorded.finishes.len(), 1);
        assert!(matches!(flow.done().outcome(), Some(Err(Error::NotFound(_)))));
        Ok(())
    }

    #[test]
    fn abort_stops_in_flight_stream() -> Result<()> {
        let (executor, dispatcher) = manual();
        let mut sink = RecordingSink::new(&dispatcher);
        sink.manual_accept = true;
        let pipeline = Pipeline::from_tap(&dispatcher, BytesTap::new(&b"abcdef"[..], 1))
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        executor.run_until_idle();
        flow.abort(Error::Cancelled);
        executor.run_until_idle();
        let accept = sink.accepts.lock().first().cloned();
        if let Some(accept) = accept {
            accept.ring(());
        }
        executor.run_until_idle();
        let recorded = sink.recorded.lock();
        assert_eq!(recorded.slices.len(), 1);
        assert_eq!(recorded.finishes.len(), 1);
        assert!(matches!(recorded.finishes[0], Err(Error::Cancelled)));
        assert!(!recorded.drained_after_finish);
        assert!(matches!(flow.done().outcome(), Some(Err(Error::Cancelled))));
        Ok(())
    }

    #[test]
    fn drain_after_finish_is_rejected() -> Result<()> {
        let (executor, dispatcher) = manual();
        let sink = RecordingSink::new(&dispatcher);
        let pipeline = Pipeline::from_tap(&dispatcher, BytesTap::new(bytes::Bytes::new(), 1))
            .attach(Pipeline::from_sink(&dispatcher, sink.clone()))?;
        let flow = pipeline.start()?;
        executor.run_until_idle();
        assert!(flow.head.is_finished());
        let late = flow.head.drain(Slice::new(&b"late"[..], 0));
        executor.run_until_idle();
        assert!(late.is_failed());
        assert!(sink.recorded.lock().slices.is_empty());
        assert_eq!(sink.recorded.lock().finishes.len(), 1);
        Ok(())
    }
}
