//! Local-disk endpoint.
//!
//! All file system access runs as tokio tasks on the session's runtime and is bridged back into
//! bells. Every metadata operation takes an ops token and slices read or written take slice
//! tokens from the [`throttle`] crate. Only taps hold open-file permits: a sink is opened before
//! its tap starts, so permits taken on both ends could be exhausted by sinks alone.

use crate::bell::Bell;
use crate::dispatch::Dispatcher;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::pipe::{Outlet, Sink, Tap};
use crate::resource::{Lifecycle, Resource, Session, SessionId};
use crate::slice::Slice;
use crate::stat::Stat;
use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Largest slice a tap reads at once.
    pub read_size: usize,
    /// Unit for slice tokens; 0 disables slice throttling.
    pub chunk_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_size: 128 * 1024,
            chunk_size: 0,
        }
    }
}

#[derive(Debug)]
pub struct LocalSession {
    id: SessionId,
    dispatcher: Dispatcher,
    handle: tokio::runtime::Handle,
    lifecycle: Lifecycle,
    settings: Settings,
}

impl LocalSession {
    pub fn new(
        dispatcher: &Dispatcher,
        handle: tokio::runtime::Handle,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let url = url::Url::parse("file:///").map_err(anyhow::Error::from)?;
        Ok(Arc::new(Self {
            id: SessionId::new(url),
            dispatcher: dispatcher.clone(),
            handle,
            lifecycle: Lifecycle::new(),
            settings,
        }))
    }

    /// Session on the tokio runtime the caller runs on, dispatching callbacks there as well.
    pub fn current(settings: Settings) -> Result<Arc<Self>> {
        let handle = tokio::runtime::Handle::try_current().map_err(anyhow::Error::from)?;
        Self::new(&Dispatcher::tokio(handle.clone()), handle, settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn spawn<T, F>(&self, future: F) -> Bell<T>
    where
        T: Clone + Send + Sync + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Bell::from_future(&self.dispatcher, &self.handle, future)
    }
}

impl Session for LocalSession {
    type Resource = LocalResource;

    fn id(&self) -> &SessionId {
        &self.id
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn select(self: &Arc<Self>, path: &Path) -> LocalResource {
        LocalResource {
            session: self.clone(),
            path: path.to_path_buf(),
        }
    }
}

#[derive(Clone)]
pub struct LocalResource {
    session: Arc<LocalSession>,
    path: PathBuf,
}

impl std::fmt::Debug for LocalResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LocalResource").field(&self.path).finish()
    }
}

#[instrument]
async fn stat(path: PathBuf) -> Result<Stat> {
    throttle::get_ops_token().await;
    let link = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))?;
    let metadata = if link.is_symlink() {
        tokio::fs::metadata(&path)
            .await
            .map_err(|error| Error::from_io(error, &path))?
    } else {
        link.clone()
    };
    let name = path
        .file_name()
        .map_or_else(|| "/".to_string(), |name| name.to_string_lossy().into_owned());
    let mut stat = Stat::from_metadata(name, &metadata);
    if link.is_symlink() {
        stat.link = tokio::fs::read_link(&path)
            .await
            .ok()
            .map(|target| target.to_string_lossy().into_owned());
    }
    Ok(stat)
}

async fn list(path: PathBuf, names: Emitter<String>) -> Result<()> {
    throttle::get_ops_token().await;
    let mut entries = tokio::fs::read_dir(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| Error::from_io(error, &path))?
    {
        if !names.emit(entry.file_name().to_string_lossy().into_owned()) {
            tracing::debug!("listing of {:?} abandoned", path);
            break;
        }
    }
    Ok(())
}

#[async_recursion]
#[instrument]
async fn remove(path: PathBuf) -> Result<()> {
    throttle::get_ops_token().await;
    let metadata = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))?;
    if !metadata.is_dir() {
        return tokio::fs::remove_file(&path)
            .await
            .map_err(|error| Error::from_io(error, &path));
    }
    let mut entries = tokio::fs::read_dir(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))?;
    let mut join_set = tokio::task::JoinSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| Error::from_io(error, &path))?
    {
        join_set.spawn(remove(entry.path()));
    }
    let mut first_error = None;
    while let Some(removed) = join_set.join_next().await {
        if let Err(error) = removed.map_err(anyhow::Error::from)? {
            tracing::error!("failed removing under {:?}: {}", path, error);
            first_error.get_or_insert(error);
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }
    tokio::fs::remove_dir(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))
}

impl Resource for LocalResource {
    type Session = LocalSession;

    fn session(&self) -> &Arc<LocalSession> {
        &self.session
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn do_stat(&self) -> Bell<Stat> {
        self.session.spawn(stat(self.path.clone()))
    }

    fn do_list(&self) -> Emitter<String> {
        let names = Emitter::new(self.dispatcher());
        let out = names.clone();
        let path = self.path.clone();
        self.session.handle.spawn(async move {
            match list(path, out.clone()).await {
                Ok(()) => out.finish(),
                Err(error) => out.fail(error),
            };
        });
        names
    }

    fn do_mkdir(&self) -> Bell<()> {
        let path = self.path.clone();
        self.session.spawn(async move {
            throttle::get_ops_token().await;
            tokio::fs::create_dir(&path)
                .await
                .map_err(|error| Error::from_io(error, &path))
        })
    }

    fn do_delete(&self) -> Bell<()> {
        self.session.spawn(remove(self.path.clone()))
    }

    fn do_tap(&self) -> Result<Box<dyn Tap>> {
        Ok(Box::new(LocalTap {
            resource: self.clone(),
        }))
    }

    fn do_sink(&self) -> Result<Box<dyn Sink>> {
        Ok(Box::new(LocalSink {
            resource: self.clone(),
            file: Arc::new(tokio::sync::Mutex::new(None)),
        }))
    }
}

struct LocalTap {
    resource: LocalResource,
}

/// Reads `path` slice by slice, waiting for each slice to be accepted before reading the next.
#[instrument(skip(outlet))]
async fn read_into(path: PathBuf, settings: Settings, outlet: &Outlet) -> Result<()> {
    let _open_file_guard = throttle::open_file_permit().await;
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|error| Error::from_io(error, &path))?;
    let mut offset = 0u64;
    let mut buffer = vec![0u8; std::cmp::max(1, settings.read_size)];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|error| Error::from_io(error, &path))?;
        if read == 0 {
            return Ok(());
        }
        throttle::get_slice_tokens(settings.chunk_size, read as u64).await;
        let slice = Slice::new(bytes::Bytes::copy_from_slice(&buffer[..read]), offset);
        offset += read as u64;
        outlet.drain(slice).get().await?;
    }
}

impl Tap for LocalTap {
    fn start(&self, ready: Bell<()>, outlet: Outlet) {
        let session = self.resource.session.clone();
        let path = self.resource.path.clone();
        ready.on_done(move |()| {
            let settings = session.settings;
            session.handle.spawn(async move {
                match read_into(path.clone(), settings, &outlet).await {
                    Ok(()) => {
                        outlet.finish(Ok(()));
                    }
                    Err(error) if outlet.is_finished() => {
                        tracing::debug!("stopped reading {:?}: {}", path, error);
                    }
                    Err(error) => {
                        outlet.finish(Err(error));
                    }
                }
            });
        });
    }
}

struct LocalSink {
    resource: LocalResource,
    file: Arc<tokio::sync::Mutex<Option<tokio::fs::File>>>,
}

impl Sink for LocalSink {
    fn start(&self) -> Bell<()> {
        let path = self.resource.path.clone();
        let file = self.file.clone();
        self.resource.session.spawn(async move {
            tracing::debug!("opening {:?} for writing", path);
            let opened = tokio::fs::File::create(&path)
                .await
                .map_err(|error| Error::from_io(error, &path))?;
            *file.lock().await = Some(opened);
            Ok(())
        })
    }

    fn drain(&self, slice: Slice) -> Bell<()> {
        let path = self.resource.path.clone();
        let file = self.file.clone();
        let chunk_size = self.resource.session.settings.chunk_size;
        self.resource.session.spawn(async move {
            throttle::get_slice_tokens(chunk_size, slice.len() as u64).await;
            let mut file = file.lock().await;
            let Some(file) = file.as_mut() else {
                return Err(Error::msg(format!("{path:?} is not open for writing")));
            };
            file.seek(std::io::SeekFrom::Start(slice.offset()))
                .await
                .map_err(|error| Error::from_io(error, &path))?;
            file.write_all(slice.bytes())
                .await
                .map_err(|error| Error::from_io(error, &path))
        })
    }

    fn finish(&self, outcome: Result<()>) -> Bell<()> {
        let path = self.resource.path.clone();
        let file = self.file.clone();
        self.resource.session.spawn(async move {
            let Some(mut opened) = file.lock().await.take() else {
                return Ok(());
            };
            match outcome {
                Ok(()) => opened
                    .flush()
                    .await
                    .map_err(|error| Error::from_io(error, &path)),
                Err(error) => {
                    drop(opened);
                    tracing::debug!("removing partial {:?} after: {}", path, error);
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => Ok(()),
                        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(error) => Err(Error::from_io(error, &path)),
                    }
                }
            }
        })
    }
}
