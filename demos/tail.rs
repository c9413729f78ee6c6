//! Tails a given set of files, printing whatever is appended to them.
//!
//! Usage:
//!     tail /path/to/file1 /path/to/file2 ...
//!
//! Set `RUST_LOG=filetail=debug` to see what the workers and the coordinator
//! are doing.

use filetail::{SinkEvent, TailCoordinator};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let tails = TailCoordinator::new();
    let (sink, mut events) = mpsc::unbounded_channel();

    for f in args {
        tails.start_tail(&f, sink.clone())?;
    }
    drop(sink);

    // Ends once every tail has ended for good.
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Chunk(chunk) => print!("({}) {}", chunk.source().display(), chunk.text()),
            SinkEvent::Error(notice) => eprintln!("{}", notice),
        }
    }

    tails.shutdown().await?;

    Ok(())
}
