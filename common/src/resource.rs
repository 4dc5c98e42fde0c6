//! Addressable endpoints and the sessions they are evaluated through.
//!
//! A [`Session`] is the stateful connection context for one endpoint and credential. A
//! [`Resource`] is a path (possibly a wildcard) within a session; it holds no connection state
//! of its own and every operation goes through the session, which is initialized on first use.
//!
//! Endpoint implementations provide the `do_*` hooks of [`Resource`]; anything they leave out
//! fails with [`Error::Unsupported`] when called. The provided operations wrap the hooks with
//! the session's mediated initialization.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::pipe::{Outlet, Sink, Tap};
use crate::slice::Slice;
use crate::stat::Stat;
use crate::transfer::{Transfer, TransferOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Who a session authenticates as. The secret never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub user: String,
    secret: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Endpoint and credential; sessions with equal ids are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub url: url::Url,
    pub credential: Option<Credential>,
}

impl SessionId {
    pub fn new(url: url::Url) -> Self {
        Self {
            url,
            credential: None,
        }
    }

    /// Parses `endpoint`. A password embedded in the URL is moved into the credential.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let mut url = url::Url::parse(endpoint)
            .map_err(|err| Error::msg(format!("invalid endpoint {endpoint:?}: {err}")))?;
        let credential = match url.password() {
            Some(secret) => Some(Credential::new(url.username(), secret)),
            None if !url.username().is_empty() => Some(Credential::new(url.username(), "")),
            None => None,
        };
        if credential.is_some() {
            // cannot fail: the url has credentials, so it has a host
            let _ = url.set_password(None);
            let _ = url.set_username("");
        }
        Ok(Self { url, credential })
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.credential {
            Some(credential) => write!(f, "{} as {}", self.url, credential.user),
            None => write!(f, "{}", self.url),
        }
    }
}

enum LifecycleState {
    Idle,
    Started(Bell<()>),
    Closed,
}

/// Mediated initialization and closing of a session.
///
/// The first caller of [`ensure`](Self::ensure) runs the initializer and every caller shares
/// its outcome. Closing is terminal: pending initialization fails and no new one is attempted.
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            LifecycleState::Idle => "idle",
            LifecycleState::Started(_) => "started",
            LifecycleState::Closed => "closed",
        };
        f.debug_struct("Lifecycle").field("state", &state).finish()
    }
}

fn closed_error() -> Error {
    Error::msg("session is closed")
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    pub fn ensure(
        &self,
        dispatcher: &Dispatcher,
        initialize: impl FnOnce() -> Option<Bell<()>>,
    ) -> Bell<()> {
        let shared = {
            let mut state = self.state.lock();
            match &*state {
                LifecycleState::Closed => return Bell::failed(dispatcher, closed_error()),
                LifecycleState::Started(shared) => return shared.clone(),
                LifecycleState::Idle => {
                    let shared = Bell::new(dispatcher);
                    *state = LifecycleState::Started(shared.clone());
                    shared
                }
            }
        };
        match initialize() {
            Some(init) => {
                init.promise(&shared);
            }
            None => {
                shared.ring(());
            }
        }
        shared
    }

    /// Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), LifecycleState::Closed);
        match previous {
            LifecycleState::Closed => false,
            LifecycleState::Idle => true,
            LifecycleState::Started(shared) => {
                shared.ring_err(closed_error());
                true
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), LifecycleState::Closed)
    }
}

/// Connection context for one endpoint.
pub trait Session: Send + Sync + Sized + 'static {
    type Resource: Resource<Session = Self>;

    fn id(&self) -> &SessionId;

    fn dispatcher(&self) -> &Dispatcher;

    fn lifecycle(&self) -> &Lifecycle;

    /// Builds the resource at `path` without doing any I/O.
    fn select(self: &Arc<Self>, path: &Path) -> Self::Resource;

    /// Asynchronous setup, run at most once; `None` when there is nothing to set up.
    fn initialize(self: &Arc<Self>) -> Option<Bell<()>> {
        None
    }

    /// Releases connection state once the session is closed.
    fn cleanup(&self) {}

    /// Initializes the session if nobody has yet and returns the shared outcome.
    fn ready(self: &Arc<Self>) -> Bell<()> {
        let session = self.clone();
        self.lifecycle()
            .ensure(self.dispatcher(), move || session.initialize())
    }

    fn close(&self) {
        if self.lifecycle().close() {
            tracing::debug!("closing session {}", self.id());
            self.cleanup();
        }
    }

    fn is_closed(&self) -> bool {
        self.lifecycle().is_closed()
    }
}

fn has_wildcard(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// A path within a session.
pub trait Resource: Clone + Send + Sync + std::fmt::Debug + 'static {
    type Session: Session<Resource = Self>;

    fn session(&self) -> &Arc<Self::Session>;

    fn path(&self) -> &Path;

    fn do_stat(&self) -> Bell<Stat> {
        Bell::failed(self.session().dispatcher(), Error::unsupported("stat"))
    }

    /// Names of the directory's children.
    fn do_list(&self) -> Emitter<String> {
        Emitter::failed(self.session().dispatcher(), Error::unsupported("list"))
    }

    fn do_mkdir(&self) -> Bell<()> {
        Bell::failed(self.session().dispatcher(), Error::unsupported("mkdir"))
    }

    fn do_delete(&self) -> Bell<()> {
        Bell::failed(self.session().dispatcher(), Error::unsupported("delete"))
    }

    fn do_tap(&self) -> Result<Box<dyn Tap>> {
        Err(Error::unsupported("tap"))
    }

    fn do_sink(&self) -> Result<Box<dyn Sink>> {
        Err(Error::unsupported("sink"))
    }

    /// Called on both ends once a transfer involving this resource stopped.
    fn transfer_done(&self, _outcome: &Result<()>) {}

    fn dispatcher(&self) -> &Dispatcher {
        self.session().dispatcher()
    }

    fn select(&self, path: &Path) -> Self {
        self.session().select(path)
    }

    /// Same path on `session`, which must be equivalent to the current one.
    fn reselect_on(&self, session: &Arc<Self::Session>) -> Result<Self> {
        if session.id() != self.session().id() {
            return Err(Error::msg(format!(
                "cannot reselect {:?} from {} onto {}",
                self.path(),
                self.session().id(),
                session.id()
            )));
        }
        Ok(session.select(self.path()))
    }

    /// Same session and path.
    fn same_as(&self, other: &Self) -> bool {
        self.session().id() == other.session().id() && self.path() == other.path()
    }

    fn name(&self) -> Option<&str> {
        self.path().file_name().and_then(|name| name.to_str())
    }

    /// Whether the path names exactly one object, i.e. its last component has no wildcard.
    fn is_singleton(&self) -> bool {
        !self.name().is_some_and(has_wildcard)
    }

    fn parent(&self) -> Option<Self> {
        self.path().parent().map(|parent| self.select(parent))
    }

    /// Whether `name` is matched by the last path component.
    fn matches(&self, name: &str) -> Result<bool> {
        let Some(pattern) = self.name() else {
            return Ok(false);
        };
        if !has_wildcard(pattern) {
            return Ok(pattern == name);
        }
        let matcher = globset::Glob::new(pattern)
            .map_err(anyhow::Error::from)?
            .compile_matcher();
        Ok(matcher.is_match(name))
    }

    fn stat(&self) -> Bell<Stat> {
        let resource = self.clone();
        self.session().ready().and_then(move |()| resource.do_stat())
    }

    fn list(&self) -> Emitter<String> {
        let names = Emitter::new(self.dispatcher());
        let out = names.clone();
        let resource = self.clone();
        self.session().ready().on_always(move |ready| match ready {
            Ok(()) => {
                let forward = out.clone();
                resource
                    .do_list()
                    .for_each(move |name| {
                        forward.emit(name);
                    })
                    .on_always(move |listed| {
                        match listed {
                            Ok(()) => out.finish(),
                            Err(error) => out.fail(error.clone()),
                        };
                    });
            }
            Err(error) => {
                out.fail(error.clone());
            }
        });
        names
    }

    fn mkdir(&self) -> Bell<Self> {
        let resource = self.clone();
        let created = self.clone();
        self.session()
            .ready()
            .and_then(move |()| resource.do_mkdir())
            .replace(created)
    }

    fn delete(&self) -> Bell<Self> {
        let resource = self.clone();
        let deleted = self.clone();
        self.session()
            .ready()
            .and_then(move |()| resource.do_delete())
            .replace(deleted)
    }

    /// Source end for this resource's data, gated on session initialization.
    fn tap(&self) -> GatedTap<Self::Session> {
        GatedTap {
            session: self.session().clone(),
            inner: self.do_tap().map(Arc::from),
        }
    }

    /// Destination end for this resource's data, gated on session initialization.
    fn sink(&self) -> GatedSink<Self::Session> {
        GatedSink {
            session: self.session().clone(),
            inner: self.do_sink().map(Arc::from),
        }
    }

    /// Transfers this resource into `destination` with the generic tree transfer.
    fn transfer_to<D: Resource>(
        &self,
        destination: &D,
        options: TransferOptions,
    ) -> Arc<dyn Transfer<Source = Self, Destination = D>> {
        Arc::new(crate::proxy::ProxyTransfer::new(
            self.clone(),
            destination.clone(),
            options,
        ))
    }
}

/// Tap that starts only after its session is ready.
pub struct GatedTap<S: Session> {
    session: Arc<S>,
    inner: Result<Arc<dyn Tap>>,
}

impl<S: Session> Tap for GatedTap<S> {
    fn start(&self, ready: Bell<()>, outlet: Outlet) {
        let inner = match &self.inner {
            Ok(inner) => inner.clone(),
            Err(error) => {
                outlet.finish(Err(error.clone()));
                return;
            }
        };
        let gate = self.session.ready().and(&ready);
        {
            let outlet = outlet.clone();
            gate.on_fail(move |error| {
                outlet.finish(Err(error.clone()));
            });
        }
        inner.start(gate, outlet);
    }
}

/// Sink that reports ready only after its session is.
pub struct GatedSink<S: Session> {
    session: Arc<S>,
    inner: Result<Arc<dyn Sink>>,
}

impl<S: Session> Sink for GatedSink<S> {
    fn start(&self) -> Bell<()> {
        match &self.inner {
            Ok(inner) => {
                let inner = inner.clone();
                self.session.ready().and_then(move |()| inner.start())
            }
            Err(error) => Bell::failed(self.session.dispatcher(), error.clone()),
        }
    }

    fn drain(&self, slice: Slice) -> Bell<()> {
        match &self.inner {
            Ok(inner) => inner.drain(slice),
            Err(error) => Bell::failed(self.session.dispatcher(), error.clone()),
        }
    }

    fn finish(&self, outcome: Result<()>) -> Bell<()> {
        match &self.inner {
            Ok(inner) => inner.finish(outcome),
            Err(_) => Bell::resolved(self.session.dispatcher(), ()),
        }
    }
}

/// Open sessions kept for reuse, keyed by [`SessionId`].
pub struct SessionCache<S: Session> {
    sessions: Mutex<HashMap<SessionId, Vec<Arc<S>>>>,
}

impl<S: Session> Default for SessionCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session> std::fmt::Debug for SessionCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("sessions", &self.len())
            .finish()
    }
}

impl<S: Session> SessionCache<S> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `session` to the cache. Closed sessions are dropped; returns whether it was kept.
    pub fn checkin(&self, session: Arc<S>) -> bool {
        if session.is_closed() {
            tracing::debug!("not caching closed session {}", session.id());
            return false;
        }
        self.sessions
            .lock()
            .entry(session.id().clone())
            .or_default()
            .push(session);
        true
    }

    /// Takes an open, otherwise unused session equivalent to `id` out of the cache. Closed
    /// sessions and sessions still referenced elsewhere are discarded on the way.
    pub fn checkout(&self, id: &SessionId) -> Option<Arc<S>> {
        let mut sessions = self.sessions.lock();
        let candidates = sessions.get_mut(id)?;
        let mut found = None;
        while let Some(session) = candidates.pop() {
            if session.is_closed() {
                tracing::debug!("discarding closed session {}", id);
                continue;
            }
            if Arc::strong_count(&session) > 1 {
                tracing::debug!("discarding session {} in use elsewhere", id);
                continue;
            }
            found = Some(session);
            break;
        }
        if candidates.is_empty() {
            sessions.remove(id);
        }
        found
    }

    /// Checks `resource`'s session back in once `stopped` resolves, whatever the outcome.
    /// Pass a transfer's [`on_stop`](Transfer::on_stop) bell to reuse its endpoints afterwards.
    pub fn checkin_when_stopped(self: &Arc<Self>, resource: &S::Resource, stopped: &Bell<()>) {
        let cache = Arc::downgrade(self);
        let session = resource.session().clone();
        stopped.on_always(move |_| {
            if let Some(cache) = cache.upgrade() {
                cache.checkin(session);
            }
        });
    }

    /// Rebinds `resource` onto a cached equivalent session, if there is one.
    pub fn reselect(&self, resource: &S::Resource) -> S::Resource {
        match self.checkout(resource.session().id()) {
            Some(session) => session.select(resource.path()),
            None => resource.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Joins a path relative to a transfer's root onto `root`; the empty path is the root itself.
pub fn resolve(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
