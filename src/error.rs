//! Error types returned by the public API and delivered to sinks.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors returned directly to the caller of the coordinator API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("path has no file name: {0}")]
    InvalidPath(PathBuf),
    #[error("path is a directory: {0}")]
    IsDirectory(PathBuf),
    #[error("failed to watch {path}: {source}")]
    WatchSetup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("tail coordinator has shut down")]
    Shutdown,
}

/// The kind of error notice delivered to a sink.
///
/// Every notice ends the session for its path; no further chunks follow
/// until the path is started again. Sinks receive every kind except
/// [`Locked`](TailErrorKind::Locked).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TailErrorKind {
    NotFound,
    PermissionDenied,
    /// Another process holds a lock on the file. Lock contention is retried,
    /// so this kind is never delivered as a notice of its own; it only
    /// appears in the message of an `Exhausted` notice.
    Locked,
    /// The file was deleted or renamed away. Terminal.
    Removed,
    WatchSetupFailure,
    /// The restart budget was used up. Terminal.
    Exhausted,
}

impl fmt::Display for TailErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TailErrorKind::NotFound => "not found",
            TailErrorKind::PermissionDenied => "permission denied",
            TailErrorKind::Locked => "locked",
            TailErrorKind::Removed => "removed",
            TailErrorKind::WatchSetupFailure => "watch setup failure",
            TailErrorKind::Exhausted => "retries exhausted",
        };
        f.write_str(name)
    }
}

/// A structured error notice for a tailed path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorNotice {
    source: PathBuf,
    kind: TailErrorKind,
    message: String,
}

impl ErrorNotice {
    pub(crate) fn new(source: PathBuf, kind: TailErrorKind, message: impl Into<String>) -> Self {
        ErrorNotice {
            source,
            kind,
            message: message.into(),
        }
    }

    /// Returns the path the notice is about.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    pub fn kind(&self) -> TailErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tail Error ({}): {}: {}",
            self.kind,
            self.source.display(),
            self.message
        )
    }
}

/// Maps an I/O error from opening or reading the file onto a notice kind.
///
/// Returns `None` for errors that have no dedicated kind; those are only
/// ever surfaced through `Exhausted`.
pub(crate) fn io_error_kind(err: &io::Error) -> Option<TailErrorKind> {
    if is_lock_violation(err) {
        return Some(TailErrorKind::Locked);
    }
    match err.kind() {
        io::ErrorKind::NotFound => Some(TailErrorKind::NotFound),
        io::ErrorKind::PermissionDenied => Some(TailErrorKind::PermissionDenied),
        io::ErrorKind::WouldBlock => Some(TailErrorKind::Locked),
        _ => None,
    }
}

#[cfg(windows)]
fn is_lock_violation(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(err.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(windows))]
fn is_lock_violation(_err: &io::Error) -> bool {
    false
}
