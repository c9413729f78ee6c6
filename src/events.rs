//! Everything related to watching a tailed file for growth, truncation,
//! replacement and removal.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::ready;
use futures_util::stream::{Stream as FuturesStream, StreamExt};
use notify::event::{EventKind, ModifyKind};
use tokio::sync::mpsc;

use crate::Error;

type RawEvent = notify::Result<notify::Event>;

/// A normalized change to a watched file.
///
/// The watcher never trusts the details reported by the OS. Every
/// notification touching the path triggers a fresh `stat`, and the result is
/// compared against what was last observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChangeEvent {
    /// The file is longer than last observed.
    Grew,
    /// The file is shorter than last observed, or was replaced by another
    /// file at the same path.
    Truncated,
    /// The file was deleted or renamed away.
    Removed,
    /// The notification mechanism itself failed.
    WatchError(String),
}

/// Identifies a file independently of its path, where the platform allows.
#[cfg(unix)]
pub(crate) type FileId = (u64, u64);
#[cfg(not(unix))]
pub(crate) type FileId = ();

#[cfg(unix)]
pub(crate) fn file_id(metadata: &fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
pub(crate) fn file_id(_metadata: &fs::Metadata) -> Option<FileId> {
    None
}

/// Watches a single file, and can be polled to receive [`ChangeEvent`]s.
///
/// Internally, `ChangeWatcher` contains a [`notify::Watcher`] registered on
/// both the file and its containing directory. Raw events are queued from the
/// notify thread without blocking it, and are classified one at a time as the
/// owner pulls them. Dropping the watcher releases the OS watch resources.
///
/// [`notify::Watcher`]: ../notify/trait.Watcher.html
pub struct ChangeWatcher {
    inner: Option<notify::RecommendedWatcher>,
    path: PathBuf,
    directory: PathBuf,
    known_len: u64,
    known_id: Option<FileId>,
    removed: bool,
    event_stream: mpsc::UnboundedReceiver<RawEvent>,
}

impl Debug for ChangeWatcher {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("ChangeWatcher")
            .field("path", &self.path)
            .field("directory", &self.directory)
            .field("known_len", &self.known_len)
            .field("removed", &self.removed)
            .finish()
    }
}

impl ChangeWatcher {
    /// Begins observing `path`, which should already be absolute (see
    /// [`TailCoordinator::start_tail`]).
    ///
    /// Fails with [`Error::WatchSetup`] if the containing directory cannot be
    /// watched, e.g. because it does not exist.
    ///
    /// [`TailCoordinator::start_tail`]: crate::TailCoordinator::start_tail
    pub fn start(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let directory = path
            .parent()
            .ok_or_else(|| Error::InvalidPath(path.clone()))?
            .to_path_buf();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner: notify::RecommendedWatcher = notify::Watcher::new(
            move |res: RawEvent| {
                // The only way `send` can fail is if the receiver is dropped,
                // which only happens once the watcher itself is going away.
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|source| Error::WatchSetup {
            path: path.clone(),
            source,
        })?;

        notify::Watcher::watch(&mut inner, &directory, notify::RecursiveMode::NonRecursive)
            .map_err(|source| Error::WatchSetup {
                path: directory.clone(),
                source,
            })?;

        let mut watcher = Self::with_stream(path, rx);
        watcher.inner = Some(inner);
        if watcher.path.exists() {
            watcher.watch_file();
        }

        tracing::trace!(path = %watcher.path.display(), "watch started");

        Ok(watcher)
    }

    fn with_stream(path: PathBuf, event_stream: mpsc::UnboundedReceiver<RawEvent>) -> Self {
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let (known_len, known_id) = match fs::metadata(&path) {
            Ok(metadata) => (metadata.len(), file_id(&metadata)),
            Err(_) => (0, None),
        };

        ChangeWatcher {
            inner: None,
            path,
            directory,
            known_len,
            known_id,
            removed: false,
            event_stream,
        }
    }

    /// Builds a watcher fed from `event_stream` instead of the OS.
    #[cfg(test)]
    pub(crate) fn from_channel(
        path: impl Into<PathBuf>,
        event_stream: mpsc::UnboundedReceiver<RawEvent>,
    ) -> Self {
        Self::with_stream(path.into(), event_stream)
    }

    /// Returns the watched path.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Stops observation and releases the OS watch resources.
    pub fn stop(self) {
        tracing::trace!(path = %self.path.display(), "watch stopped");
        drop(self);
    }

    /// Waits for the next change, returning `None` once the underlying
    /// notification source has gone away.
    ///
    /// This method is cancel safe.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.next().await
    }

    fn watch_file(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            // The directory watch still reports changes where per-file
            // watches are unavailable.
            if let Err(e) =
                notify::Watcher::watch(inner, &self.path, notify::RecursiveMode::NonRecursive)
            {
                tracing::debug!(path = %self.path.display(), error = %e, "file watch not added");
            }
        }
    }

    fn classify(&mut self, res: RawEvent) -> Option<ChangeEvent> {
        if self.removed {
            return None;
        }

        let event = match res {
            Ok(event) => event,
            Err(e) => return Some(ChangeEvent::WatchError(e.to_string())),
        };

        if event.need_rescan() {
            return self.recheck();
        }

        if let EventKind::Access(_) = event.kind {
            return None;
        }

        if event.paths.iter().any(|path| path == &self.path) {
            return self.recheck();
        }

        if event.paths.iter().any(|path| path == &self.directory) {
            match event.kind {
                EventKind::Remove(_) => {
                    return Some(ChangeEvent::WatchError(format!(
                        "watched directory {} was removed",
                        self.directory.display()
                    )))
                }
                EventKind::Modify(ModifyKind::Name(_)) => {
                    return Some(ChangeEvent::WatchError(format!(
                        "watched directory {} was moved",
                        self.directory.display()
                    )))
                }
                _ => {}
            }
        }

        None
    }

    /// Compares the file currently at the path with what was last observed.
    fn recheck(&mut self) -> Option<ChangeEvent> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.removed = true;
                return Some(ChangeEvent::Removed);
            }
            Err(e) => {
                return Some(ChangeEvent::WatchError(format!(
                    "failed to stat {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let len = metadata.len();
        let id = file_id(&metadata);

        if id.is_some() && self.known_id.is_some() && id != self.known_id {
            tracing::trace!(path = %self.path.display(), "file replaced");
            self.known_id = id;
            self.known_len = len;
            self.watch_file();
            return Some(ChangeEvent::Truncated);
        }
        if self.known_id.is_none() {
            self.known_id = id;
        }

        let previous = std::mem::replace(&mut self.known_len, len);
        match len.cmp(&previous) {
            std::cmp::Ordering::Less => Some(ChangeEvent::Truncated),
            std::cmp::Ordering::Greater => Some(ChangeEvent::Grew),
            // Duplicate or coalesced notification
            std::cmp::Ordering::Equal => None,
        }
    }
}

impl FuturesStream for ChangeWatcher {
    type Item = ChangeEvent;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let res = match ready!(this.event_stream.poll_recv(cx)) {
                Some(res) => res,
                None => return task::Poll::Ready(None),
            };

            if let Some(event) = this.classify(res) {
                return task::Poll::Ready(Some(event));
            }
        }
    }
}

/// Where workers obtain their change watchers from.
pub(crate) trait EventSource: Send + Sync + 'static {
    fn watch(&self, path: &Path) -> Result<ChangeWatcher, Error>;
}

/// Watches through the OS notification API.
#[derive(Debug, Default)]
pub(crate) struct NotifySource;

impl EventSource for NotifySource {
    fn watch(&self, path: &Path) -> Result<ChangeWatcher, Error> {
        ChangeWatcher::start(path)
    }
}

/// Resolves `path` to an absolute file path.
///
/// The containing directory is canonicalized when it exists, so the result
/// matches the paths reported by notify. The file itself need not exist.
pub(crate) fn resolve_file_path(path: impl Into<PathBuf>) -> Result<PathBuf, Error> {
    let path = path.into();

    let filename = path
        .file_name()
        .ok_or_else(|| Error::InvalidPath(path.clone()))?
        .to_os_string();

    let dir = match path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };

    let dir = match dir.canonicalize() {
        Ok(abs_dir) => abs_dir,
        Err(_) if dir.is_relative() => std::env::current_dir()?.join(dir),
        Err(_) => dir,
    };

    let resolved = dir.join(filename);
    if resolved.is_dir() {
        return Err(Error::IsDirectory(resolved));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn modify(path: &Path) -> RawEvent {
        Ok(notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)))
            .add_path(path.to_path_buf()))
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
    }

    async fn next(watcher: &mut ChangeWatcher) -> Option<ChangeEvent> {
        timeout(Duration::from_millis(100), watcher.next_event())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_resolve_directory() {
        let tmp_dir = tempdir().unwrap();
        assert!(matches!(
            resolve_file_path(tmp_dir.path()),
            Err(Error::IsDirectory(_))
        ));
    }

    #[test]
    fn test_resolve_bad_filename() {
        let tmp_dir = tempdir().unwrap();

        // This is not okay
        let path = tmp_dir.path().join("..");
        assert!(matches!(resolve_file_path(path), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_resolve_missing_file() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("missing.log");

        let resolved = resolve_file_path(&path).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved.file_name(), path.file_name());
        assert_eq!(
            resolved.parent().unwrap(),
            tmp_dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_resolve_relative() {
        let resolved = resolve_file_path("some-relative-file.log").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("some-relative-file.log"));
    }

    #[tokio::test]
    async fn test_classify_growth_and_truncation() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        fs::write(&path, b"abc").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ChangeWatcher::from_channel(&path, rx);

        append(&path, b"de");
        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, Some(ChangeEvent::Grew));

        // Same length again is a duplicate
        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, None);

        fs::write(&path, b"x").unwrap();
        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, Some(ChangeEvent::Truncated));
    }

    #[tokio::test]
    async fn test_classify_ignores_other_paths() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        let other = tmp_dir.path().join("b.log");
        fs::write(&path, b"abc").unwrap();
        fs::write(&other, b"abc").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ChangeWatcher::from_channel(&path, rx);

        append(&path, b"more");
        tx.send(modify(&other)).unwrap();
        tx.send(Ok(notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(other.clone())))
        .unwrap();
        assert_eq!(next(&mut watcher).await, None);

        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, Some(ChangeEvent::Grew));
    }

    #[tokio::test]
    async fn test_classify_removal_once() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        fs::write(&path, b"abc").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ChangeWatcher::from_channel(&path, rx);

        fs::remove_file(&path).unwrap();
        tx.send(Ok(notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(path.clone())))
        .unwrap();
        assert_eq!(next(&mut watcher).await, Some(ChangeEvent::Removed));

        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, None);
    }

    #[tokio::test]
    async fn test_classify_watch_errors() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        fs::write(&path, b"abc").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ChangeWatcher::from_channel(&path, rx);

        tx.send(Err(notify::Error::generic("inotify queue broke")))
            .unwrap();
        match next(&mut watcher).await {
            Some(ChangeEvent::WatchError(reason)) => assert!(reason.contains("inotify queue broke")),
            other => panic!("unexpected event: {:?}", other),
        }

        tx.send(Ok(notify::Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(tmp_dir.path().to_path_buf())))
        .unwrap();
        assert!(matches!(
            next(&mut watcher).await,
            Some(ChangeEvent::WatchError(_))
        ));

        drop(tx);
        assert_eq!(watcher.next_event().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_classify_replacement() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        let staged = tmp_dir.path().join("a.log.new");
        fs::write(&path, b"abc").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ChangeWatcher::from_channel(&path, rx);

        // Longer content, but a different file
        fs::write(&staged, b"abcdefgh").unwrap();
        fs::rename(&staged, &path).unwrap();
        tx.send(Ok(notify::Event::new(EventKind::Modify(ModifyKind::Name(
            notify::event::RenameMode::To,
        )))
        .add_path(path.clone())))
        .unwrap();
        assert_eq!(next(&mut watcher).await, Some(ChangeEvent::Truncated));

        // Both halves of the rename may be reported
        tx.send(modify(&path)).unwrap();
        assert_eq!(next(&mut watcher).await, None);
    }

    #[test]
    fn test_start_missing_directory() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("nope").join("a.log");

        assert!(matches!(
            ChangeWatcher::start(path),
            Err(Error::WatchSetup { .. })
        ));
    }

    #[tokio::test]
    async fn test_watch_real_file() {
        let tmp_dir = tempdir().unwrap();
        let path = resolve_file_path(tmp_dir.path().join("real.log")).unwrap();
        fs::write(&path, b"hello\n").unwrap();

        let mut watcher = ChangeWatcher::start(&path).unwrap();

        append(&path, b"world\n");
        let event = timeout(Duration::from_secs(2), watcher.next_event())
            .await
            .unwrap();
        assert_eq!(event, Some(ChangeEvent::Grew));

        fs::remove_file(&path).unwrap();
        let removed = timeout(Duration::from_secs(2), async {
            while let Some(event) = watcher.next_event().await {
                if event == ChangeEvent::Removed {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(removed);

        watcher.stop();
    }
}
