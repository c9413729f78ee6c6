//! A library providing supervised, asynchronous tailing for (namely log) files.
//!
//! Each tailed file gets its own worker task that delivers the current
//! content once, then every appended byte exactly once, to a [`TailSink`].
//! Truncated or replaced files are read again from the start. Workers that
//! fail are restarted by the [`TailCoordinator`] with a bounded retry budget.
//!
//! Also available is the underlying per-file change stream
//! ([`ChangeWatcher`], driven by [`notify`](https://crates.io/crates/notify)).
//!
//! ## Example
//!
//! ```no_run
//! use filetail::{SinkEvent, TailCoordinator};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), filetail::Error> {
//!     let tails = TailCoordinator::new();
//!     let (sink, mut events) = mpsc::unbounded_channel();
//!
//!     tails.start_tail("some/file.log", sink.clone())?;
//!     tails.start_tail("/some/other/file.log", sink)?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SinkEvent::Chunk(chunk) => print!("{}", chunk.text()),
//!             SinkEvent::Error(notice) => eprintln!("{}", notice),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Changes are detected by comparing the file's length (and, on Unix, its
//! inode) against what was last seen. A file that is truncated and then grows
//! past its old length before the change is noticed looks like plain growth.
//!
//! The directory containing a tailed file must exist and be watchable.

mod config;
mod coordinator;
mod error;
mod events;
mod reader;
mod sink;
mod worker;

pub use config::TailConfig;
pub use coordinator::{SessionStatus, TailCoordinator};
pub use error::{Error, ErrorNotice, TailErrorKind};
pub use events::{ChangeEvent, ChangeWatcher};
pub use reader::Chunk;
pub use sink::{SinkEvent, TailSink};
