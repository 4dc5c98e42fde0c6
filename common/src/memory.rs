//! In-memory endpoint.
//!
//! A [`MemoryStore`] is a tree of directories and files kept in a map. Sessions opened on the
//! same store see the same tree. Faults can be injected per path and operation, which is what
//! the transfer tests use to exercise failure handling without touching a disk.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::pipe::{BytesTap, Outlet, Sink, Tap};
use crate::resource::{Lifecycle, Resource, Session, SessionId};
use crate::slice::Slice;
use crate::stat::Stat;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(bytes::Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Stat,
    List,
    Mkdir,
    Delete,
    Tap,
    /// Sink start.
    Sink,
    /// Every slice drained into the sink.
    Drain,
}

#[derive(Debug, Clone)]
pub enum Fault {
    Fail(Error),
    /// The operation never completes.
    Stall,
}

#[derive(Debug, Default)]
struct Counters {
    open_sinks: usize,
    peak_open_sinks: usize,
}

#[derive(Debug)]
struct StoreInner {
    id: SessionId,
    chunk_size: usize,
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
    faults: Mutex<HashMap<(PathBuf, Op), Fault>>,
    finishes: Mutex<Vec<(PathBuf, Result<()>)>>,
    counters: Mutex<Counters>,
    transfers_done: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Result<Self> {
        Self::with_chunk_size(name, 4)
    }

    /// `chunk_size` is the slice length taps emit. Sessions on the store are identified as
    /// `memory://<name>`.
    pub fn with_chunk_size(name: &str, chunk_size: usize) -> Result<Self> {
        let id = SessionId::parse(&format!("memory://{name}"))?;
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::Dir);
        Ok(Self {
            inner: Arc::new(StoreInner {
                id,
                chunk_size: std::cmp::max(1, chunk_size),
                nodes: Mutex::new(nodes),
                faults: Mutex::default(),
                finishes: Mutex::default(),
                counters: Mutex::default(),
                transfers_done: AtomicUsize::new(0),
            }),
        })
    }

    pub fn session(&self, dispatcher: &Dispatcher) -> Arc<MemorySession> {
        self.open(dispatcher, None)
    }

    /// Session whose initialization completes when `init` does.
    pub fn session_with_init(
        &self,
        dispatcher: &Dispatcher,
        init: Bell<()>,
    ) -> Arc<MemorySession> {
        self.open(dispatcher, Some(init))
    }

    fn open(&self, dispatcher: &Dispatcher, init: Option<Bell<()>>) -> Arc<MemorySession> {
        Arc::new(MemorySession {
            id: self.inner.id.clone(),
            dispatcher: dispatcher.clone(),
            lifecycle: Lifecycle::new(),
            store: self.clone(),
            init,
            initializations: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            nodes.entry(ancestor.to_path_buf()).or_insert(Node::Dir);
        }
    }

    /// Adds a directory, creating missing parents.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut nodes = self.inner.nodes.lock();
        Self::insert_parents(&mut nodes, path.as_ref());
        nodes.insert(path.as_ref().to_path_buf(), Node::Dir);
    }

    /// Adds a file, creating missing parents.
    pub fn add_file(&self, path: impl AsRef<Path>, data: impl Into<bytes::Bytes>) {
        let mut nodes = self.inner.nodes.lock();
        Self::insert_parents(&mut nodes, path.as_ref());
        nodes.insert(path.as_ref().to_path_buf(), Node::File(data.into()));
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<bytes::Bytes> {
        match self.inner.nodes.lock().get(path.as_ref()) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.inner.nodes.lock().contains_key(path.as_ref())
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        matches!(self.inner.nodes.lock().get(path.as_ref()), Some(Node::Dir))
    }

    pub fn inject(&self, path: impl AsRef<Path>, op: Op, fault: Fault) {
        self.inner
            .faults
            .lock()
            .insert((path.as_ref().to_path_buf(), op), fault);
    }

    pub fn fail(&self, path: impl AsRef<Path>, op: Op, error: Error) {
        self.inject(path, op, Fault::Fail(error));
    }

    pub fn stall(&self, path: impl AsRef<Path>, op: Op) {
        self.inject(path, op, Fault::Stall);
    }

    /// Outcomes every sink for `path` was finished with, in order.
    pub fn finishes(&self, path: impl AsRef<Path>) -> Vec<Result<()>> {
        self.inner
            .finishes
            .lock()
            .iter()
            .filter(|(finished, _)| finished == path.as_ref())
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }

    /// Most sinks that were open at the same time.
    pub fn peak_open_sinks(&self) -> usize {
        self.inner.counters.lock().peak_open_sinks
    }

    /// How many times a resource of this store was told a transfer stopped.
    pub fn transfers_done(&self) -> usize {
        self.inner.transfers_done.load(Ordering::Relaxed)
    }

    fn fault(&self, path: &Path, op: Op) -> Option<Fault> {
        self.inner
            .faults
            .lock()
            .get(&(path.to_path_buf(), op))
            .cloned()
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    dispatcher: Dispatcher,
    lifecycle: Lifecycle,
    store: MemoryStore,
    init: Option<Bell<()>>,
    initializations: AtomicUsize,
    cleanups: AtomicUsize,
}

impl MemorySession {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::Relaxed)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::Relaxed)
    }
}

impl Session for MemorySession {
    type Resource = MemoryResource;

    fn id(&self) -> &SessionId {
        &self.id
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn select(self: &Arc<Self>, path: &Path) -> MemoryResource {
        MemoryResource {
            session: self.clone(),
            path: path.to_path_buf(),
        }
    }

    fn initialize(self: &Arc<Self>) -> Option<Bell<()>> {
        self.initializations.fetch_add(1, Ordering::Relaxed);
        self.init.clone()
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct MemoryResource {
    session: Arc<MemorySession>,
    path: PathBuf,
}

impl std::fmt::Debug for MemoryResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResource")
            .field("session", &self.session.id.url.as_str())
            .field("path", &self.path)
            .finish()
    }
}

impl MemoryResource {
    fn store(&self) -> &MemoryStore {
        &self.session.store
    }

    // Some(bell) when a fault replaces the operation
    fn faulted<T: Clone + Send + Sync + 'static>(&self, op: Op) -> Option<Bell<T>> {
        match self.store().fault(&self.path, op)? {
            Fault::Fail(error) => Some(Bell::failed(self.dispatcher(), error)),
            Fault::Stall => Some(Bell::new(self.dispatcher())),
        }
    }

    fn not_found(&self) -> Error {
        Error::NotFound(format!("{:?}", self.path))
    }
}

impl Resource for MemoryResource {
    type Session = MemorySession;

    fn session(&self) -> &Arc<MemorySession> {
        &self.session
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn do_stat(&self) -> Bell<Stat> {
        if let Some(faulted) = self.faulted(Op::Stat) {
            return faulted;
        }
        let name = self.name().unwrap_or("/").to_string();
        let stat = match self.store().inner.nodes.lock().get(&self.path) {
            Some(Node::Dir) => Ok(Stat::directory(name)),
            Some(Node::File(data)) => Ok(Stat::file(name, data.len() as u64)),
            None => Err(self.not_found()),
        };
        Bell::from_result(self.dispatcher(), stat)
    }

    fn do_list(&self) -> Emitter<String> {
        if let Some(Fault::Fail(error)) = self.store().fault(&self.path, Op::List) {
            return Emitter::failed(self.dispatcher(), error);
        }
        let names: Result<Vec<String>> = {
            let nodes = self.store().inner.nodes.lock();
            match nodes.get(&self.path) {
                Some(Node::Dir) => Ok(nodes
                    .range(self.path.clone()..)
                    .skip(1)
                    .take_while(|(path, _)| path.starts_with(&self.path))
                    .filter(|(path, _)| path.parent() == Some(self.path.as_path()))
                    .filter_map(|(path, _)| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect()),
                Some(Node::File(_)) => {
                    Err(Error::msg(format!("{:?} is not a directory", self.path)))
                }
                None => Err(self.not_found()),
            }
        };
        match names {
            Ok(names) => {
                let emitter = Emitter::from_iter(self.dispatcher(), names);
                if let Some(Fault::Stall) = self.store().fault(&self.path, Op::List) {
                    // names are out but the listing never ends
                    let open = Emitter::new(self.dispatcher());
                    let forward = open.clone();
                    emitter.for_each(move |name| {
                        forward.emit(name);
                    });
                    return open;
                }
                emitter
            }
            Err(error) => Emitter::failed(self.dispatcher(), error),
        }
    }

    fn do_mkdir(&self) -> Bell<()> {
        if let Some(faulted) = self.faulted(Op::Mkdir) {
            return faulted;
        }
        let mut nodes = self.store().inner.nodes.lock();
        let created = if nodes.contains_key(&self.path) {
            Err(Error::AlreadyExists(format!("{:?}", self.path)))
        } else if !self
            .path
            .parent()
            .is_none_or(|parent| matches!(nodes.get(parent), Some(Node::Dir)))
        {
            Err(Error::NotFound(format!("parent of {:?}", self.path)))
        } else {
            nodes.insert(self.path.clone(), Node::Dir);
            Ok(())
        };
        Bell::from_result(self.dispatcher(), created)
    }

    fn do_delete(&self) -> Bell<()> {
        if let Some(faulted) = self.faulted(Op::Delete) {
            return faulted;
        }
        let mut nodes = self.store().inner.nodes.lock();
        if !nodes.contains_key(&self.path) {
            return Bell::failed(self.dispatcher(), self.not_found());
        }
        nodes.retain(|path, _| !path.starts_with(&self.path));
        Bell::resolved(self.dispatcher(), ())
    }

    fn do_tap(&self) -> Result<Box<dyn Tap>> {
        Ok(Box::new(MemoryTap {
            resource: self.clone(),
        }))
    }

    fn do_sink(&self) -> Result<Box<dyn Sink>> {
        Ok(Box::new(MemorySink {
            resource: self.clone(),
            state: Mutex::new(SinkState::default()),
        }))
    }

    fn transfer_done(&self, _outcome: &Result<()>) {
        self.store()
            .inner
            .transfers_done
            .fetch_add(1, Ordering::Relaxed);
    }
}

struct MemoryTap {
    resource: MemoryResource,
}

impl Tap for MemoryTap {
    fn start(&self, ready: Bell<()>, outlet: Outlet) {
        let resource = self.resource.clone();
        ready.on_done(move |()| {
            match resource.store().fault(&resource.path, Op::Tap) {
                Some(Fault::Fail(error)) => {
                    outlet.finish(Err(error));
                    return;
                }
                Some(Fault::Stall) => return,
                None => {}
            }
            match resource.store().read(&resource.path) {
                Some(data) => {
                    let chunk_size = resource.store().inner.chunk_size;
                    BytesTap::new(data, chunk_size)
                        .start(Bell::resolved(resource.dispatcher(), ()), outlet);
                }
                None => {
                    outlet.finish(Err(resource.not_found()));
                }
            }
        });
    }
}

#[derive(Default)]
struct SinkState {
    data: Vec<u8>,
    open: bool,
}

struct MemorySink {
    resource: MemoryResource,
    state: Mutex<SinkState>,
}

impl Sink for MemorySink {
    fn start(&self) -> Bell<()> {
        if let Some(faulted) = self.resource.faulted(Op::Sink) {
            return faulted;
        }
        let store = self.resource.store();
        let parent_is_dir = self
            .resource
            .path
            .parent()
            .is_none_or(|parent| store.is_dir(parent));
        if !parent_is_dir {
            return Bell::failed(
                self.resource.dispatcher(),
                Error::NotFound(format!("parent of {:?}", self.resource.path)),
            );
        }
        if store.is_dir(&self.resource.path) {
            return Bell::failed(
                self.resource.dispatcher(),
                Error::AlreadyExists(format!("{:?} is a directory", self.resource.path)),
            );
        }
        self.state.lock().open = true;
        let mut counters = store.inner.counters.lock();
        counters.open_sinks += 1;
        counters.peak_open_sinks = std::cmp::max(counters.peak_open_sinks, counters.open_sinks);
        Bell::resolved(self.resource.dispatcher(), ())
    }

    fn drain(&self, slice: Slice) -> Bell<()> {
        if let Some(faulted) = self.resource.faulted(Op::Drain) {
            return faulted;
        }
        let mut state = self.state.lock();
        let start = slice.offset() as usize;
        let end = start + slice.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(slice.bytes());
        Bell::resolved(self.resource.dispatcher(), ())
    }

    fn finish(&self, outcome: Result<()>) -> Bell<()> {
        let store = self.resource.store();
        let (data, was_open) = {
            let mut state = self.state.lock();
            let was_open = std::mem::replace(&mut state.open, false);
            (std::mem::take(&mut state.data), was_open)
        };
        if was_open {
            store.inner.counters.lock().open_sinks -= 1;
        }
        if outcome.is_ok() {
            store
                .inner
                .nodes
                .lock()
                .insert(self.resource.path.clone(), Node::File(data.into()));
        }
        store
            .inner
            .finishes
            .lock()
            .push((self.resource.path.clone(), outcome));
        Bell::resolved(self.resource.dispatcher(), ())
    }
}
