//! `WorkerAdapter` (spec.md §4.6): one adapter instance supervises every
//! task of a given worker kind. `CliAdapter` is the concrete
//! implementation shared by all kinds — only argument construction
//! (`commands.rs`) differs between them.

use crate::events::WorkerEventStream;
use async_trait::async_trait;
use dashmap::DashMap;
use roboppi_common::{
    Artifact, CancelHandle, CancelReason, CostRecord, ErrorClass, WorkerEvent, WorkerHandle,
    WorkerHandleId, WorkerResult, WorkerStatus, WorkerTask,
};
use roboppi_process::{ExitFuture, ExitOutcome, ProcessManager, ProcessResult, SpawnOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    async fn start_task(&self, task: WorkerTask) -> ProcessResult<WorkerHandle>;
    /// `None` if `handle` is unknown to this adapter (already awaited, or
    /// never started here).
    fn stream_events(&self, handle: &WorkerHandle) -> Option<WorkerEventStream>;
    async fn cancel(&self, handle: &WorkerHandle);
    async fn await_result(&self, handle: &WorkerHandle) -> WorkerResult;
}

struct ActiveTask {
    events: broadcast::Sender<WorkerEvent>,
    result_rx: oneshot::Receiver<WorkerResult>,
}

/// Recognized structured stdout records (spec.md §4.6). Anything that
/// doesn't parse as one of these falls back to a raw stdout event.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdoutRecord {
    Patch { file_path: String, unified_diff: String },
    Progress { message: String, percent: Option<f32> },
}

pub struct CliAdapter {
    process: ProcessManager,
    command: Box<dyn Fn(&WorkerTask) -> (String, Vec<String>) + Send + Sync>,
    active: DashMap<WorkerHandleId, ActiveTask>,
}

impl CliAdapter {
    pub fn new(
        process: ProcessManager,
        command: impl Fn(&WorkerTask) -> (String, Vec<String>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            process,
            command: Box::new(command),
            active: DashMap::new(),
        }
    }
}

#[async_trait]
impl WorkerAdapter for CliAdapter {
    async fn start_task(&self, task: WorkerTask) -> ProcessResult<WorkerHandle> {
        let (command, args) = (self.command)(&task);
        let opts = SpawnOptions {
            command,
            args,
            cwd: task.workspace.clone(),
            env: HashMap::new(),
            cancel: task.abort.clone(),
            timeout: Some(task.budget.deadline),
            grace_period: task.budget.grace_period_or_default(),
            process_group: true,
        };
        let (spawned, exit) = self.process.spawn(opts)?;

        let (events_tx, _) = broadcast::channel(256);
        let (result_tx, result_rx) = oneshot::channel();

        let stdout = BufReader::new(spawned.stdout);
        let stderr = BufReader::new(spawned.stderr);
        let abort = task.abort.clone();
        let events_for_drive = events_tx.clone();
        let started_at = Instant::now();
        let activity = task.activity.clone();

        tokio::spawn(drive(
            stdout,
            stderr,
            exit,
            abort,
            events_for_drive,
            result_tx,
            started_at,
            activity,
        ));

        let handle = WorkerHandle {
            id: task.task_id,
            worker_kind: task.worker_kind.clone(),
            abort: task.abort,
        };
        self.active.insert(
            handle.id,
            ActiveTask {
                events: events_tx,
                result_rx,
            },
        );
        Ok(handle)
    }

    fn stream_events(&self, handle: &WorkerHandle) -> Option<WorkerEventStream> {
        self.active
            .get(&handle.id)
            .map(|entry| WorkerEventStream::new(entry.events.subscribe()))
    }

    async fn cancel(&self, handle: &WorkerHandle) {
        debug!(handle_id = %handle.id, "adapter cancel requested");
        handle
            .abort
            .fire(CancelReason::Other("cancelled by gateway".to_string()));
    }

    async fn await_result(&self, handle: &WorkerHandle) -> WorkerResult {
        match self.active.remove(&handle.id) {
            Some((_, active)) => active.result_rx.await.unwrap_or_else(|_| {
                WorkerResult::failed(ErrorClass::NonRetryable, "worker task dropped before completion")
            }),
            None => WorkerResult::failed(ErrorClass::NonRetryable, "unknown worker handle"),
        }
    }
}

/// Drains both stdio streams to completion, parsing stdout as it goes,
/// then awaits the process exit and resolves the terminal `WorkerResult`
/// exactly once. Runs regardless of whether anyone is subscribed to
/// `events` — the two consumption patterns of spec.md §4.6 both end up
/// reading the same `observations` collected here, so a caller that skips
/// streaming entirely still gets the complete log back from
/// `awaitResult`.
async fn drive(
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
    exit: ExitFuture,
    abort: CancelHandle,
    events_tx: broadcast::Sender<WorkerEvent>,
    result_tx: oneshot::Sender<WorkerResult>,
    started_at: Instant,
    activity: Option<roboppi_common::ActivitySink>,
) {
    let observations = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
    let artifacts = std::sync::Arc::new(Mutex::new(Vec::<Artifact>::new()));

    let stdout_task = {
        let observations = std::sync::Arc::clone(&observations);
        let artifacts = std::sync::Arc::clone(&artifacts);
        let events_tx = events_tx.clone();
        let activity = activity.clone();
        tokio::spawn(async move {
            let mut lines = stdout.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(activity) = &activity {
                    activity.ping();
                }
                match serde_json::from_str::<StdoutRecord>(&line) {
                    Ok(StdoutRecord::Patch { file_path, unified_diff }) => {
                        artifacts.lock().unwrap_or_else(|e| e.into_inner()).push(Artifact {
                            kind: "patch".to_string(),
                            reference: file_path.clone(),
                            content: Some(unified_diff.clone()),
                        });
                        let _ = events_tx.send(WorkerEvent::Patch { file_path, unified_diff });
                    }
                    Ok(StdoutRecord::Progress { message, percent }) => {
                        let _ = events_tx.send(WorkerEvent::Progress { message, percent });
                    }
                    Err(_) => {
                        let _ = events_tx.send(WorkerEvent::Stdout {
                            bytes: line.clone().into_bytes(),
                        });
                    }
                }
                observations.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            }
        })
    };

    let stderr_task = {
        let observations = std::sync::Arc::clone(&observations);
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = stderr.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(activity) = &activity {
                    activity.ping();
                }
                let _ = events_tx.send(WorkerEvent::Stderr {
                    bytes: line.clone().into_bytes(),
                });
                observations.lock().unwrap_or_else(|e| e.into_inner()).push(line);
            }
        })
    };

    let _ = tokio::join!(stdout_task, stderr_task);
    let outcome = exit.await;
    let duration = started_at.elapsed();

    let observations = std::sync::Arc::try_unwrap(observations)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_default();
    let artifacts = std::sync::Arc::try_unwrap(artifacts)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_default();

    let combined = observations.join("\n");
    let (status, error_class) = classify_exit(&outcome, &abort, &combined);

    let result = WorkerResult {
        status,
        artifacts,
        observations,
        cost: CostRecord {
            wall_time: duration,
            token_estimate: None,
        },
        duration,
        exit_code: outcome.code,
        error_class,
    };
    let _ = result_tx.send(result);
}

/// Exit-code classification (spec.md §4.6's exact rule list).
fn classify_exit(
    outcome: &ExitOutcome,
    abort: &CancelHandle,
    combined_output: &str,
) -> (WorkerStatus, Option<ErrorClass>) {
    if abort.is_aborted() {
        return match abort.reason() {
            Some(CancelReason::Deadline) => (WorkerStatus::TimedOut, Some(ErrorClass::RetryableTransient)),
            _ => (WorkerStatus::Cancelled, None),
        };
    }

    if outcome.signal.is_some() {
        return (WorkerStatus::Failed, Some(ErrorClass::RetryableTransient));
    }

    match outcome.code {
        Some(0) => (WorkerStatus::Succeeded, None),
        _ => {
            let lower = combined_output.to_lowercase();
            let class = if lower.contains("rate limit") || lower.contains("rate-limit") || lower.contains("429") {
                ErrorClass::RetryableRateLimit
            } else if lower.contains("connection refused")
                || lower.contains("connection reset")
                || lower.contains("timed out")
                || lower.contains("timeout")
            {
                ErrorClass::RetryableNetwork
            } else {
                ErrorClass::NonRetryable
            };
            (WorkerStatus::Failed, Some(class))
        }
    }
}

/// Adapter for `WorkerKind::Inline` tasks (plugin-event jobs):
/// resolves immediately with the task's instructions recorded as a
/// single observation, no subprocess involved.
pub struct InlineAdapter {
    pending: DashMap<WorkerHandleId, WorkerResult>,
}

impl InlineAdapter {
    pub fn new() -> Self {
        Self { pending: DashMap::new() }
    }
}

impl Default for InlineAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerAdapter for InlineAdapter {
    async fn start_task(&self, task: WorkerTask) -> ProcessResult<WorkerHandle> {
        let handle = WorkerHandle {
            id: task.task_id,
            worker_kind: task.worker_kind.clone(),
            abort: task.abort.clone(),
        };
        let result = WorkerResult {
            status: WorkerStatus::Succeeded,
            artifacts: Vec::new(),
            observations: vec![task.instructions.clone()],
            cost: CostRecord {
                wall_time: Duration::ZERO,
                token_estimate: None,
            },
            duration: Duration::ZERO,
            exit_code: Some(0),
            error_class: None,
        };
        self.pending.insert(handle.id, result);
        Ok(handle)
    }

    fn stream_events(&self, _handle: &WorkerHandle) -> Option<WorkerEventStream> {
        None
    }

    async fn cancel(&self, _handle: &WorkerHandle) {}

    async fn await_result(&self, handle: &WorkerHandle) -> WorkerResult {
        self.pending
            .remove(&handle.id)
            .map(|(_, result)| result)
            .unwrap_or_else(|| WorkerResult::failed(ErrorClass::NonRetryable, "unknown inline task handle"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use roboppi_common::OutputMode;
    use roboppi_common::WorkerBudget;
    use roboppi_common::WorkerKind;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn task(command: &str, args: Vec<&str>) -> WorkerTask {
        WorkerTask {
            task_id: WorkerHandleId::new(),
            worker_kind: WorkerKind::Custom(command.to_string()),
            workspace: PathBuf::from("/"),
            instructions: args.join(" "),
            capabilities: HashSet::new(),
            output_mode: OutputMode::Batch,
            budget: WorkerBudget {
                deadline: Duration::from_secs(5),
                max_steps: None,
                max_command_time: None,
                grace_period: Some(Duration::from_millis(200)),
            },
            abort: CancelHandle::new(),
            activity: None,
        }
    }

    #[tokio::test]
    async fn start_task_and_await_result_reports_success() {
        let adapter = CliAdapter::new(ProcessManager::new(), |_task: &WorkerTask| {
            ("true".to_string(), Vec::new())
        });
        let t = task("true", vec![]);
        let handle = adapter.start_task(t).await.expect("spawn should succeed");
        let result = tokio::time::timeout(Duration::from_secs(5), adapter.await_result(&handle))
            .await
            .expect("should finish promptly");
        assert_eq!(result.status, WorkerStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_non_retryable_by_default() {
        let adapter = CliAdapter::new(ProcessManager::new(), |_task: &WorkerTask| {
            ("false".to_string(), Vec::new())
        });
        let t = task("false", vec![]);
        let handle = adapter.start_task(t).await.expect("spawn should succeed");
        let result = tokio::time::timeout(Duration::from_secs(5), adapter.await_result(&handle))
            .await
            .expect("should finish promptly");
        assert_eq!(result.status, WorkerStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::NonRetryable));
    }

    #[tokio::test]
    async fn stdout_lines_become_observations() {
        let adapter = CliAdapter::new(ProcessManager::new(), |_task: &WorkerTask| {
            ("echo".to_string(), vec!["hello".to_string()])
        });
        let t = task("echo", vec!["hello"]);
        let handle = adapter.start_task(t).await.expect("spawn should succeed");
        let result = tokio::time::timeout(Duration::from_secs(5), adapter.await_result(&handle))
            .await
            .expect("should finish promptly");
        assert!(result.observations.iter().any(|line| line.contains("hello")));
    }

    #[tokio::test]
    async fn inline_adapter_resolves_immediately_with_instructions_as_observation() {
        let adapter = InlineAdapter::new();
        let mut t = task("ignored", vec![]);
        t.worker_kind = WorkerKind::Inline;
        t.instructions = "plugin fired: webhook received".to_string();
        let handle = adapter.start_task(t).await.expect("inline start never fails");
        let result = adapter.await_result(&handle).await;
        assert_eq!(result.status, WorkerStatus::Succeeded);
        assert_eq!(result.observations, vec!["plugin fired: webhook received".to_string()]);
    }

    #[tokio::test]
    async fn unknown_handle_reports_non_retryable_failure() {
        let adapter = CliAdapter::new(ProcessManager::new(), |_task: &WorkerTask| {
            ("true".to_string(), Vec::new())
        });
        let bogus = WorkerHandle {
            id: WorkerHandleId::new(),
            worker_kind: WorkerKind::Custom("ghost".to_string()),
            abort: CancelHandle::new(),
        };
        let result = adapter.await_result(&bogus).await;
        assert_eq!(result.status, WorkerStatus::Failed);
    }
}
