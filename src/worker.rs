//! The per-file tail: one open handle, one change watcher, one task.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::events::{ChangeEvent, EventSource, FileId};
use crate::reader::{Chunk, ChunkReader};
use crate::{Error, TailSink};

/// Why a worker stopped on its own.
#[derive(Debug)]
pub(crate) enum Failure {
    /// The file could not be opened.
    Open(io::Error),
    /// Reading or reopening an already open file failed.
    Read(io::Error),
    WatchSetup(Error),
    Watch(String),
    Removed,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Open(e) => write!(f, "failed to open file: {}", e),
            Failure::Read(e) => write!(f, "failed to read file: {}", e),
            Failure::WatchSetup(e) => write!(f, "{}", e),
            Failure::Watch(reason) => write!(f, "watch failed: {}", reason),
            Failure::Removed => f.write_str("file removed"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReportKind {
    /// The worker has been watching long enough, or has delivered growth.
    Healthy,
    Failed(Failure),
}

/// Message from a worker to the coordinator.
#[derive(Debug)]
pub(crate) struct Report {
    pub path: PathBuf,
    pub generation: u64,
    pub kind: ReportKind,
}

/// Owner's side of a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Asks the worker to stop at its next await point. Does not wait.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Waits until the worker task has finished and released its resources.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// How far a session has got, handed from each worker to its successor.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    offset: AtomicU64,
    /// The file `offset` counts into.
    file: Mutex<Option<FileId>>,
}

impl Progress {
    /// Bytes of the file delivered so far.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    fn file(&self) -> Option<FileId> {
        *self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_file(&self, id: Option<FileId>) {
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }
}

pub(crate) struct TailWorker {
    pub path: PathBuf,
    pub generation: u64,
    pub sink: Arc<dyn TailSink>,
    pub source: Arc<dyn EventSource>,
    /// Shared with the coordinator so a restarted worker continues where
    /// this one left off.
    pub progress: Arc<Progress>,
    pub healthy_dwell: Duration,
    pub reports: mpsc::UnboundedSender<Report>,
}

impl TailWorker {
    /// Runs the worker on its own task, after waiting `delay`.
    pub fn spawn(self, delay: Duration) -> WorkerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(delay, stop_rx));

        WorkerHandle {
            stop: Some(stop_tx),
            join,
        }
    }

    async fn run(mut self, delay: Duration, mut stop: oneshot::Receiver<()>) {
        // A dropped handle counts as a stop request too.
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = &mut stop => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let failure = tokio::select! {
            biased;
            _ = &mut stop => None,
            failure = self.tail() => Some(failure),
        };

        match failure {
            None => {
                tracing::debug!(path = %self.path.display(), "tail worker stopped");
            }
            Some(failure) => {
                tracing::debug!(
                    path = %self.path.display(),
                    generation = self.generation,
                    reason = %failure,
                    "tail worker failed"
                );
                self.report(ReportKind::Failed(failure));
            }
        }
    }

    fn report(&self, kind: ReportKind) {
        let _ = self.reports.send(Report {
            path: self.path.clone(),
            generation: self.generation,
            kind,
        });
    }

    async fn tail(&mut self) -> Failure {
        match self.follow().await {
            Ok(()) => Failure::Watch("change notifications ended".to_string()),
            Err(failure) => failure,
        }
    }

    /// Opening, initial read, then watching until something goes wrong.
    async fn follow(&mut self) -> Result<(), Failure> {
        let resume_from = self.progress.offset();
        let mut reader = ChunkReader::open(&self.path, resume_from, self.progress.file())
            .await
            .map_err(Failure::Open)?;

        if reader.offset() < resume_from {
            tracing::info!(
                path = %self.path.display(),
                resume_from,
                "file was truncated or replaced, reading from start"
            );
            self.progress.set_offset(0);
        }
        self.progress.set_file(reader.file_id());

        // Watch before reading, so nothing appended in between goes unnoticed.
        let mut watcher = self
            .source
            .watch(&self.path)
            .map_err(Failure::WatchSetup)?;

        let initial = self.deliver(&mut reader).await?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = initial,
            offset = reader.offset(),
            "initial read"
        );

        let dwell = tokio::time::sleep(self.healthy_dwell);
        tokio::pin!(dwell);
        let mut healthy = false;

        loop {
            tokio::select! {
                event = watcher.next_event() => {
                    let event = match event {
                        Some(event) => event,
                        None => return Ok(()),
                    };

                    match event {
                        ChangeEvent::Grew => {
                            self.on_growth(&mut reader).await?;
                            if !healthy {
                                healthy = true;
                                self.report(ReportKind::Healthy);
                            }
                        }
                        ChangeEvent::Truncated => self.on_truncation(&mut reader).await?,
                        ChangeEvent::Removed => return Err(Failure::Removed),
                        ChangeEvent::WatchError(reason) => return Err(Failure::Watch(reason)),
                    }
                }
                _ = &mut dwell, if !healthy => {
                    healthy = true;
                    self.report(ReportKind::Healthy);
                }
            }
        }
    }

    async fn on_growth(&mut self, reader: &mut ChunkReader) -> Result<(), Failure> {
        let len = reader.file_len().await.map_err(Failure::Read)?;
        if len < reader.offset() {
            return self.on_truncation(reader).await;
        }

        self.deliver(reader).await?;
        Ok(())
    }

    async fn on_truncation(&mut self, reader: &mut ChunkReader) -> Result<(), Failure> {
        tracing::info!(path = %self.path.display(), "file truncated, reading from start");

        reader.reopen().await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Failure::Removed,
            _ => Failure::Read(e),
        })?;
        self.progress.set_offset(0);
        self.progress.set_file(reader.file_id());

        self.deliver(reader).await?;
        Ok(())
    }

    /// Reads up to end-of-file and hands any text to the sink. Returns the
    /// number of bytes delivered.
    async fn deliver(&mut self, reader: &mut ChunkReader) -> Result<usize, Failure> {
        let text = reader.read_available().await.map_err(Failure::Read)?;
        let len = text.len();

        if !text.is_empty() {
            self.sink.on_chunk(Chunk::new(self.path.clone(), text));
        }
        self.progress.set_offset(reader.offset());

        Ok(len)
    }
}
