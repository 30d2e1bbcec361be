//! The core-side dispatch loop (spec.md §4.13): reads requests off a
//! `FrameReader`, dispatches each to the `IpcHandler`, writes the
//! matching response with the same `requestId`, and interleaves any
//! core-initiated notifications (`job_completed`, `escalation`,
//! `heartbeat`) arriving on `notifications`.
//!
//! Invalid messages are logged and dropped. Each request is dispatched on
//! its own task so a handler panic surfaces as a `JoinError` instead of
//! unwinding through the loop — either way the loop keeps running.

use crate::framing::{FrameReader, FrameWriter};
use crate::handler::IpcHandler;
use crate::protocol::Message;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, warn};

pub struct IpcServer<H> {
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Runs until `reader` hits EOF. `notifications` is drained
    /// concurrently and forwarded verbatim to `writer`.
    pub async fn run<R, W>(
        &self,
        reader: R,
        mut writer: FrameWriter<W>,
        mut notifications: mpsc::UnboundedReceiver<Message>,
    ) where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut reader = FrameReader::new(reader);

        loop {
            tokio::select! {
                frame = reader.next_frame() => {
                    match frame {
                        Ok(Some(Ok(message))) => {
                            if let Some(response) = self.dispatch(message).await {
                                if let Err(e) = writer.write_frame(&response).await {
                                    error!(error = %e, "failed writing IPC response");
                                }
                            }
                        }
                        Ok(Some(Err(e))) => {
                            warn!(error = %e, "dropping malformed IPC message");
                        }
                        Ok(None) => {
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "IPC transport error, ending session");
                            return;
                        }
                    }
                }
                notification = notifications.recv() => {
                    match notification {
                        Some(message) => {
                            if let Err(e) = writer.write_frame(&message).await {
                                error!(error = %e, "failed writing IPC notification");
                            }
                        }
                        None => {
                            // Notification channel closed; keep serving
                            // requests until the transport itself ends.
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Option<Message> {
        match message {
            Message::SubmitJob { request_id, job } => {
                let handler = Arc::clone(&self.handler);
                match tokio::spawn(async move { handler.submit_job(job).await }).await {
                    Ok(job_id) => Some(Message::Ack { request_id, job_id }),
                    Err(e) => {
                        error!(error = %e, "submit_job handler panicked");
                        Some(Message::error(request_id, "handler-panic", e.to_string()))
                    }
                }
            }
            Message::RequestPermit {
                request_id,
                job,
                attempt_index,
            } => {
                let handler = Arc::clone(&self.handler);
                match tokio::spawn(async move { handler.request_permit(job, attempt_index).await }).await {
                    Ok(Ok(permit)) => Some(Message::PermitGranted { request_id, permit }),
                    Ok(Err(rejection)) => Some(Message::PermitRejected { request_id, rejection }),
                    Err(e) => {
                        error!(error = %e, "request_permit handler panicked");
                        Some(Message::error(request_id, "handler-panic", e.to_string()))
                    }
                }
            }
            Message::CancelJob {
                request_id,
                job_id,
                reason,
            } => {
                let handler = Arc::clone(&self.handler);
                let reason_for_response = reason.clone();
                match tokio::spawn(async move { handler.cancel_job(job_id, reason).await }).await {
                    Ok(()) => Some(Message::JobCancelled {
                        request_id,
                        job_id,
                        reason: reason_for_response,
                    }),
                    Err(e) => {
                        error!(error = %e, "cancel_job handler panicked");
                        Some(Message::error(request_id, "handler-panic", e.to_string()))
                    }
                }
            }
            Message::ReportQueueMetrics {
                queue_depth,
                oldest_job_age_ms,
                backlog_count,
                ..
            } => {
                self.handler
                    .report_queue_metrics(queue_depth, oldest_job_age_ms, backlog_count);
                None
            }
            Message::Error { code, message, .. } => {
                warn!(code = %code, message = %message, "received error message from peer");
                None
            }
            // Core-initiated notification types arriving inbound would be
            // a protocol violation from the scheduler peer; log and drop
            // rather than treat as a handled request.
            other => {
                warn!(message_type = ?other, "unexpected inbound message type, dropping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobOutcome;
    use async_trait::async_trait;
    use roboppi_common::{JobKind, JobLimits, PermitId, Priority, PriorityClass};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubHandler {
        permits_granted: AtomicUsize,
    }

    #[async_trait]
    impl IpcHandler for StubHandler {
        async fn submit_job(&self, job: roboppi_common::Job) -> roboppi_common::JobId {
            job.id
        }

        async fn request_permit(
            &self,
            job: roboppi_common::Job,
            attempt_index: u32,
        ) -> Result<roboppi_common::PermitView, roboppi_common::Rejection> {
            self.permits_granted.fetch_add(1, Ordering::SeqCst);
            Ok(roboppi_common::PermitView {
                id: PermitId::new(),
                job_id: job.id,
                attempt_index,
                deadline: chrono::Utc::now(),
                tokens_cost: None,
            })
        }

        async fn cancel_job(&self, _job_id: roboppi_common::JobId, _reason: String) {}

        fn report_queue_metrics(&self, _queue_depth: u64, _oldest_job_age_ms: u64, _backlog_count: u64) {}
    }

    fn job() -> roboppi_common::Job {
        roboppi_common::Job::new(
            JobKind::WorkerTask,
            Priority {
                value: 0,
                class: PriorityClass::Interactive,
            },
            serde_json::json!({}),
            JobLimits {
                timeout: Duration::from_secs(30),
                max_attempts: 1,
                cost_hint: None,
            },
        )
    }

    #[tokio::test]
    async fn submit_job_acks_with_the_same_request_id() {
        let (client, server_io) = tokio::io::duplex(8192);
        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server_io);

        let handler = Arc::new(StubHandler {
            permits_granted: AtomicUsize::new(0),
        });
        let server = IpcServer::new(handler);
        let (_notify_tx, notify_rx) = mpsc::unbounded_channel();

        let run = tokio::spawn(async move {
            server.run(server_reader, FrameWriter::new(server_writer), notify_rx).await;
        });

        let mut writer = FrameWriter::new(&mut client_writer);
        writer
            .write_frame(&Message::SubmitJob {
                request_id: Some("r1".to_string()),
                job: job(),
            })
            .await
            .unwrap();

        let mut reader = FrameReader::new(&mut client_reader);
        let reply = reader.next_frame().await.unwrap().unwrap().unwrap();
        match reply {
            Message::Ack { request_id, .. } => assert_eq!(request_id.as_deref(), Some("r1")),
            other => panic!("expected ack, got {other:?}"),
        }

        drop(client_writer);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_and_loop_continues() {
        let (client, server_io) = tokio::io::duplex(8192);
        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server_io);

        let handler = Arc::new(StubHandler {
            permits_granted: AtomicUsize::new(0),
        });
        let server = IpcServer::new(handler);
        let (_notify_tx, notify_rx) = mpsc::unbounded_channel();

        let run = tokio::spawn(async move {
            server.run(server_reader, FrameWriter::new(server_writer), notify_rx).await;
        });

        use tokio::io::AsyncWriteExt;
        client_writer.write_all(b"not json at all\n").await.unwrap();
        let mut writer = FrameWriter::new(&mut client_writer);
        writer
            .write_frame(&Message::SubmitJob {
                request_id: Some("r2".to_string()),
                job: job(),
            })
            .await
            .unwrap();

        let mut reader = FrameReader::new(&mut client_reader);
        let reply = reader.next_frame().await.unwrap().unwrap().unwrap();
        match reply {
            Message::Ack { request_id, .. } => assert_eq!(request_id.as_deref(), Some("r2")),
            other => panic!("expected ack after malformed line was dropped, got {other:?}"),
        }

        drop(client_writer);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn notification_channel_forwards_to_writer() {
        let (client, server_io) = tokio::io::duplex(8192);
        let (mut client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server_io);

        let handler = Arc::new(StubHandler {
            permits_granted: AtomicUsize::new(0),
        });
        let server = IpcServer::new(handler);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let run = tokio::spawn(async move {
            server.run(server_reader, FrameWriter::new(server_writer), notify_rx).await;
        });

        notify_tx
            .send(Message::JobCompleted {
                job_id: roboppi_common::JobId::new(),
                outcome: JobOutcome::Succeeded,
                result: roboppi_common::WorkerResult::cancelled(Duration::from_millis(1)),
            })
            .unwrap();

        let mut reader = FrameReader::new(&mut client_reader);
        let reply = reader.next_frame().await.unwrap().unwrap().unwrap();
        assert!(matches!(reply, Message::JobCompleted { .. }));

        drop(client_writer);
        drop(notify_tx);
        run.await.unwrap();
    }
}
