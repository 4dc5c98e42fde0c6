//! Error type shared by bells, pipelines, resources and transfers.
//!
//! A [`Bell`](crate::bell::Bell) hands the same outcome to every dependent, so the error must
//! be cheap to clone: arbitrary causes are kept behind an `Arc`.

use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported(operation.into())
    }

    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(anyhow::Error::msg(message)))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Maps an I/O error on `path` onto the matching error kind, keeping the path for context.
    pub fn from_io(error: std::io::Error, path: &std::path::Path) -> Self {
        let what = format!("{path:?}: {error}");
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(what),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(what),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(what),
            std::io::ErrorKind::Unsupported => Self::Unsupported(what),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Other(Arc::new(anyhow::Error::new(error).context(what))),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(error.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(error.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(error.to_string()),
            std::io::ErrorKind::Unsupported => Self::Unsupported(error.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Other(Arc::new(error.into())),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::Other(Arc::new(error))
    }
}
