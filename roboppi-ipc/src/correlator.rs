//! Pending-request correlation (spec.md §4.13): a map keyed by
//! `requestId`, each entry holding a resolver and a timeout timer.
//! Exercises the generic "send a request, await its correlated reply"
//! shape the protocol describes — used by anything on either side of the
//! transport that issues a request and needs to wait for the matching
//! response rather than just dispatching inbound requests to a handler.

use crate::error::{IpcError, IpcResult};
use crate::protocol::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

struct PendingEntry {
    resolver: oneshot::Sender<Message>,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Correlator {
    pending: Arc<DashMap<String, PendingEntry>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Registers a wait for `request_id`'s correlated reply. If nothing
    /// arrives within `timeout`, the returned future resolves to
    /// `IpcError::Timeout` and the entry is evicted.
    pub fn wait_for(&self, request_id: String, timeout: Duration) -> impl std::future::Future<Output = IpcResult<Message>> {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let timer_key = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = pending.remove(&timer_key) {
                warn!(request_id = %timer_key, "pending IPC request timed out");
                // The receiver, if still alive, observes a closed channel
                // and maps that to its own timeout error; we don't need
                // to send anything here.
                drop(entry.resolver);
            }
        });
        self.pending.insert(request_id.clone(), PendingEntry { resolver: tx, timer });

        async move {
            match rx.await {
                Ok(message) => Ok(message),
                Err(_) => Err(IpcError::Timeout(request_id)),
            }
        }
    }

    /// Resolves the pending wait for `request_id`, if one is registered.
    /// Returns `true` if a waiter was found and notified.
    pub fn resolve(&self, request_id: &str, message: Message) -> bool {
        if let Some((_, entry)) = self.pending.remove(request_id) {
            entry.timer.abort();
            let _ = entry.resolver.send(message);
            true
        } else {
            false
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_common::JobId;

    #[tokio::test]
    async fn resolve_delivers_the_correlated_message() {
        let correlator = Correlator::new();
        let wait = correlator.wait_for("r1".to_string(), Duration::from_secs(5));
        assert!(correlator.resolve(
            "r1",
            Message::Ack {
                request_id: Some("r1".to_string()),
                job_id: JobId::new(),
            }
        ));
        let msg = wait.await.unwrap();
        assert!(matches!(msg, Message::Ack { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_request_times_out_and_is_evicted() {
        let correlator = Correlator::new();
        let wait = correlator.wait_for("r2".to_string(), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(200)).await;
        let result = wait.await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_with_no_waiter_returns_false() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(
            "missing",
            Message::Ack {
                request_id: None,
                job_id: JobId::new(),
            }
        ));
    }
}
