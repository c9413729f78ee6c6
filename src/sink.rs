//! Destinations for tailed output.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{Chunk, ErrorNotice};

/// Receives the output of a tail.
///
/// Methods are called from the worker task of the tailed path and must not
/// block for long. Chunks for one path arrive in file order.
pub trait TailSink: Send + Sync + 'static {
    fn on_chunk(&self, chunk: Chunk);

    /// Called once when a tail ends for good. No chunks follow.
    fn on_error(&self, notice: ErrorNotice);
}

/// Everything a sink can be handed, as a single value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SinkEvent {
    Chunk(Chunk),
    Error(ErrorNotice),
}

/// Forwards into a channel, for consumers that prefer to `recv().await`.
///
/// Once every tail using the sender has ended the channel closes.
impl TailSink for mpsc::UnboundedSender<SinkEvent> {
    fn on_chunk(&self, chunk: Chunk) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.send(SinkEvent::Chunk(chunk));
    }

    fn on_error(&self, notice: ErrorNotice) {
        let _ = self.send(SinkEvent::Error(notice));
    }
}

impl<T: TailSink + ?Sized> TailSink for Arc<T> {
    fn on_chunk(&self, chunk: Chunk) {
        (**self).on_chunk(chunk)
    }

    fn on_error(&self, notice: ErrorNotice) {
        (**self).on_error(notice)
    }
}
