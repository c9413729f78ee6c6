//! Everything related to starting, stopping and supervising tails.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::error::io_error_kind;
use crate::events::{resolve_file_path, EventSource, NotifySource};
use crate::worker::{Failure, Progress, Report, ReportKind, TailWorker, WorkerHandle};
use crate::{Error, ErrorNotice, TailConfig, TailErrorKind, TailSink};

/// Supervision state of one tailed path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionStatus {
    /// Consecutive restarts since the tail was last healthy.
    pub retries: u32,
    /// Restarts over the whole lifetime of the session.
    pub restarts: u64,
    /// Bytes of the file delivered so far.
    pub offset: u64,
}

enum Command {
    Start {
        path: PathBuf,
        sink: Arc<dyn TailSink>,
    },
    Stop {
        path: PathBuf,
    },
    Status {
        path: PathBuf,
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
    ActivePaths {
        reply: oneshot::Sender<Vec<PathBuf>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Starts and stops tails, and restarts the ones that fail.
///
/// `TailCoordinator` is a cheap, cloneable handle onto a supervision task
/// that exclusively owns the registry of tailed paths. [`start_tail`] and
/// [`stop_tail`] only enqueue a request and return immediately; all file I/O
/// happens on the per-path worker tasks.
///
/// A worker that fails is restarted with exponential backoff, continuing
/// after the last delivered byte, up to [`TailConfig::max_retries`]
/// consecutive times. A worker that stays healthy for
/// [`TailConfig::healthy_dwell_ms`], or delivers growth, resets the count.
///
/// Every tail is stopped once [`shutdown`] is called or the last handle is
/// dropped.
///
/// Must be created from within a tokio runtime.
///
/// [`start_tail`]: TailCoordinator::start_tail
/// [`stop_tail`]: TailCoordinator::stop_tail
/// [`shutdown`]: TailCoordinator::shutdown
#[derive(Clone)]
pub struct TailCoordinator {
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for TailCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TailCoordinator")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl Default for TailCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TailCoordinator {
    /// Constructs a coordinator with the default [`TailConfig`].
    pub fn new() -> Self {
        Self::with_source(TailConfig::default(), Arc::new(NotifySource))
    }

    pub fn with_config(config: TailConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_source(config, Arc::new(NotifySource)))
    }

    pub(crate) fn with_source(config: TailConfig, source: Arc<dyn EventSource>) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (reports, reports_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            config,
            source,
            sessions: HashMap::new(),
            next_generation: 0,
            reports,
        };
        tokio::spawn(supervisor.run(commands_rx, reports_rx));

        TailCoordinator { commands }
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Shutdown)
    }

    /// Starts tailing `path`, delivering output to `sink`.
    ///
    /// Returns the absolute version of the path, which is also what every
    /// chunk and notice carries as its source. If the path is already being
    /// tailed this does nothing, and `sink` is dropped.
    ///
    /// Problems with the file itself (missing, unreadable, ...) are reported
    /// to `sink`, not returned here.
    pub fn start_tail(
        &self,
        path: impl Into<PathBuf>,
        sink: impl TailSink,
    ) -> Result<PathBuf, Error> {
        let path = resolve_file_path(path)?;

        self.send(Command::Start {
            path: path.clone(),
            sink: Arc::new(sink),
        })?;

        Ok(path)
    }

    /// Stops tailing `path`, if it is being tailed.
    pub fn stop_tail(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let path = resolve_file_path(path)?;

        self.send(Command::Stop { path })
    }

    pub async fn status(&self, path: impl Into<PathBuf>) -> Result<Option<SessionStatus>, Error> {
        let path = resolve_file_path(path)?;
        let (reply, rx) = oneshot::channel();

        self.send(Command::Status { path, reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn is_tailing(&self, path: impl Into<PathBuf>) -> Result<bool, Error> {
        Ok(self.status(path).await?.is_some())
    }

    /// Returns every path currently being tailed, in no particular order.
    pub async fn active_paths(&self) -> Result<Vec<PathBuf>, Error> {
        let (reply, rx) = oneshot::channel();

        self.send(Command::ActivePaths { reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stops every tail and waits until their files and watches are
    /// released. Afterwards every handle returns [`Error::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();

        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

struct Session {
    sink: Arc<dyn TailSink>,
    /// Identifies the current worker; reports from older ones are stale.
    generation: u64,
    worker: WorkerHandle,
    progress: Arc<Progress>,
    retries: u32,
    restarts: u64,
    last_failure: Option<Instant>,
}

struct Supervisor {
    config: TailConfig,
    source: Arc<dyn EventSource>,
    sessions: HashMap<PathBuf, Session>,
    next_generation: u64,
    reports: mpsc::UnboundedSender<Report>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                // Never `None`, the supervisor holds a sender itself.
                Some(report) = reports.recv() => self.handle_report(report),
            }
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { path, sink } => self.start(path, sink),
            Command::Stop { path } => {
                if let Some(mut session) = self.sessions.remove(&path) {
                    session.worker.stop();
                    tracing::info!(path = %path.display(), "tail stopped");
                }
            }
            Command::Status { path, reply } => {
                let status = self.sessions.get(&path).map(|session| SessionStatus {
                    retries: session.retries,
                    restarts: session.restarts,
                    offset: session.progress.offset(),
                });
                let _ = reply.send(status);
            }
            Command::ActivePaths { reply } => {
                let _ = reply.send(self.sessions.keys().cloned().collect());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, path: PathBuf, sink: Arc<dyn TailSink>) {
        if self.sessions.contains_key(&path) {
            tracing::debug!(path = %path.display(), "already tailing, start ignored");
            return;
        }

        let progress = Arc::new(Progress::default());
        let generation = self.bump_generation();
        let worker = self.worker(&path, generation, &sink, &progress, Duration::ZERO);

        self.sessions.insert(
            path.clone(),
            Session {
                sink,
                generation,
                worker,
                progress,
                retries: 0,
                restarts: 0,
                last_failure: None,
            },
        );

        tracing::info!(path = %path.display(), "tail started");
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn worker(
        &self,
        path: &Path,
        generation: u64,
        sink: &Arc<dyn TailSink>,
        progress: &Arc<Progress>,
        delay: Duration,
    ) -> WorkerHandle {
        TailWorker {
            path: path.to_path_buf(),
            generation,
            sink: sink.clone(),
            source: self.source.clone(),
            progress: progress.clone(),
            healthy_dwell: self.config.healthy_dwell(),
            reports: self.reports.clone(),
        }
        .spawn(delay)
    }

    fn handle_report(&mut self, report: Report) {
        let Report {
            path,
            generation,
            kind,
        } = report;

        let session = match self.sessions.get_mut(&path) {
            Some(session) if session.generation == generation => session,
            _ => {
                tracing::trace!(path = %path.display(), generation, "stale worker report");
                return;
            }
        };

        match kind {
            ReportKind::Healthy => {
                if session.retries > 0 {
                    tracing::info!(
                        path = %path.display(),
                        retries = session.retries,
                        "tail recovered"
                    );
                }
                session.retries = 0;
            }
            ReportKind::Failed(failure) => self.on_failure(path, failure),
        }
    }

    fn on_failure(&mut self, path: PathBuf, failure: Failure) {
        let first_attempt = match self.sessions.get(&path) {
            Some(session) => session.restarts == 0,
            None => return,
        };

        if let Some(kind) = abandon_kind(&failure, first_attempt) {
            if let Some(session) = self.sessions.remove(&path) {
                tracing::warn!(path = %path.display(), reason = %failure, "tail abandoned");
                session
                    .sink
                    .on_error(ErrorNotice::new(path, kind, failure.to_string()));
            }
            return;
        }

        let now = Instant::now();
        let retry_window = self.config.retry_window();
        let max_retries = self.config.max_retries;

        let retries = match self.sessions.get_mut(&path) {
            Some(session) => {
                if session
                    .last_failure
                    .map_or(false, |last| now.duration_since(last) > retry_window)
                {
                    session.retries = 0;
                }
                session.last_failure = Some(now);
                session.retries
            }
            None => return,
        };

        if retries >= max_retries {
            if let Some(session) = self.sessions.remove(&path) {
                tracing::warn!(
                    path = %path.display(),
                    retries,
                    reason = %failure,
                    "tail retries exhausted"
                );
                let message = match failure_kind(&failure) {
                    Some(kind) => format!(
                        "gave up after {} restarts ({}): {}",
                        retries, kind, failure
                    ),
                    None => format!("gave up after {} restarts: {}", retries, failure),
                };
                session
                    .sink
                    .on_error(ErrorNotice::new(path, TailErrorKind::Exhausted, message));
            }
            return;
        }

        let generation = self.bump_generation();
        let attempt = retries + 1;
        let delay = self.config.backoff(attempt);

        let worker = match self.sessions.get(&path) {
            Some(session) => {
                self.worker(&path, generation, &session.sink, &session.progress, delay)
            }
            None => return,
        };

        if let Some(session) = self.sessions.get_mut(&path) {
            session.retries = attempt;
            session.restarts += 1;
            session.generation = generation;
            session.worker = worker;
        }

        tracing::info!(
            path = %path.display(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %failure,
            "restarting tail"
        );
    }

    async fn shutdown(&mut self) {
        let mut sessions: Vec<Session> = self.sessions.drain().map(|(_, session)| session).collect();

        for session in sessions.iter_mut() {
            session.worker.stop();
        }

        let count = sessions.len();
        for session in sessions {
            session.worker.join().await;
        }

        tracing::info!(sessions = count, "tail coordinator shut down");
    }
}

/// Failures that end a session immediately rather than being retried.
fn abandon_kind(failure: &Failure, first_attempt: bool) -> Option<TailErrorKind> {
    match failure {
        Failure::Removed => Some(TailErrorKind::Removed),
        Failure::Open(e) => match io_error_kind(e) {
            // It was there before the restart
            Some(TailErrorKind::NotFound) if !first_attempt => Some(TailErrorKind::Removed),
            Some(kind @ TailErrorKind::NotFound) | Some(kind @ TailErrorKind::PermissionDenied)
                if first_attempt =>
            {
                Some(kind)
            }
            _ => None,
        },
        Failure::WatchSetup(_) if first_attempt => Some(TailErrorKind::WatchSetupFailure),
        _ => None,
    }
}

fn failure_kind(failure: &Failure) -> Option<TailErrorKind> {
    match failure {
        Failure::Open(e) | Failure::Read(e) => io_error_kind(e),
        Failure::WatchSetup(_) => Some(TailErrorKind::WatchSetupFailure),
        Failure::Removed => Some(TailErrorKind::Removed),
        Failure::Watch(_) => None,
    }
}
