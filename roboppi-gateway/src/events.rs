//! The lazy event sequence consumers drain for observability (spec.md
//! §4.6): finite, ending once both of the worker's streams close.

use roboppi_common::WorkerEvent;
use tokio::sync::broadcast;

pub struct WorkerEventStream {
    rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerEventStream {
    pub(crate) fn new(rx: broadcast::Receiver<WorkerEvent>) -> Self {
        Self { rx }
    }

    /// Returns the next event, or `None` once the adapter has closed the
    /// channel (both stdio streams ended and the final result was sent).
    /// Lagged events are skipped rather than surfaced as an error, since a
    /// slow consumer losing a progress update is not fatal — the terminal
    /// `WorkerResult` still carries the complete observation log.
    pub async fn next(&mut self) -> Option<WorkerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
