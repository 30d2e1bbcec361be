//! Workflow-root artifacts (spec.md §6): `_workflow/events.jsonl` (an
//! append-only redacted event stream) and `_workflow/state.json` (the
//! current runtime snapshot, atomically replaced and debounced 500 ms).
//! Grounded on `roboppi-sentinel::stall_event`'s write-to-temp-then-rename
//! and append-line patterns, lifted from per-step to per-workflow scope.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use roboppi_common::WorkflowRuntimeState;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One line of `_workflow/events.jsonl`. `detail` carries whatever a
/// caller wants logged for the event kind; callers are responsible for
/// not putting worker instructions or secrets in it — spec.md §6 calls
/// the stream "redacted" but leaves redaction policy to the writer, not
/// this type.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub observed_at: DateTime<Utc>,
    pub step_id: Option<String>,
    pub kind: String,
    pub detail: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            observed_at: Utc::now(),
            step_id: None,
            kind: kind.into(),
            detail,
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

fn workflow_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("_workflow")
}

/// Appends one line to `<workspace_root>/_workflow/events.jsonl`,
/// creating the directory on first use.
pub async fn append_event(workspace_root: &Path, event: &WorkflowEvent) -> CoreResult<()> {
    let dir = workflow_dir(workspace_root);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| CoreError::ArtifactWrite {
            path: dir.display().to_string(),
            source,
        })?;

    let path = dir.join("events.jsonl");
    let mut line = serde_json::to_vec(event).expect("WorkflowEvent always serializes");
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| CoreError::ArtifactWrite {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(&line).await.map_err(|source| CoreError::ArtifactWrite {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

/// Writes `<workspace_root>/_workflow/state.json` via
/// write-to-temp-then-rename, unconditionally (no debounce). Used for the
/// first and final snapshot of a run; [`StateWriter`] handles the
/// debounced path for everything in between.
pub async fn write_state(workspace_root: &Path, state: &WorkflowRuntimeState) -> CoreResult<()> {
    let dir = workflow_dir(workspace_root);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| CoreError::ArtifactWrite {
            path: dir.display().to_string(),
            source,
        })?;

    let final_path = dir.join("state.json");
    let tmp_path = dir.join("state.json.tmp");
    let body = serde_json::to_vec_pretty(state).expect("WorkflowRuntimeState always serializes");

    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|source| CoreError::ArtifactWrite {
            path: tmp_path.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|source| CoreError::ArtifactWrite {
            path: final_path.display().to_string(),
            source,
        })?;
    Ok(())
}

const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

/// Debounces `state.json` rewrites to at most one per 500 ms (spec.md
/// §6). Each call to [`Self::notify`] records the latest snapshot and,
/// if no write is already scheduled, spawns one after the debounce
/// window; a snapshot that arrives mid-window replaces the pending one
/// rather than queuing a second write.
pub struct StateWriter {
    workspace_root: PathBuf,
    pending: Arc<Mutex<Option<WorkflowRuntimeState>>>,
    scheduled: Arc<std::sync::atomic::AtomicBool>,
}

impl StateWriter {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            pending: Arc::new(Mutex::new(None)),
            scheduled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Records `state` as the latest snapshot and ensures a write is
    /// scheduled. Never blocks on I/O itself.
    pub async fn notify(&self, state: WorkflowRuntimeState) {
        *self.pending.lock().await = Some(state);

        if self
            .scheduled
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let pending = Arc::clone(&self.pending);
        let scheduled = Arc::clone(&self.scheduled);
        let workspace_root = self.workspace_root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let snapshot = pending.lock().await.take();
            scheduled.store(false, std::sync::atomic::Ordering::SeqCst);
            if let Some(snapshot) = snapshot {
                if let Err(e) = write_state(&workspace_root, &snapshot).await {
                    tracing::warn!(error = %e, "failed to write debounced state.json");
                }
            }
        });
    }

    /// Flushes whatever snapshot is pending immediately, bypassing the
    /// debounce window. Call after a workflow reaches a terminal status
    /// so the final state is on disk before the process exits.
    pub async fn flush(&self) {
        let snapshot = self.pending.lock().await.take();
        if let Some(snapshot) = snapshot {
            if let Err(e) = write_state(&self.workspace_root, &snapshot).await {
                tracing::warn!(error = %e, "failed to flush final state.json");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_common::WorkflowDefinition;

    fn def() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            timeout: std::time::Duration::from_secs(60),
            concurrency: None,
            context_dir: None,
            steps: std::collections::HashMap::new(),
            default_management: None,
        }
    }

    #[tokio::test]
    async fn append_event_creates_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        append_event(dir.path(), &WorkflowEvent::new("started", serde_json::json!({})))
            .await
            .unwrap();
        append_event(dir.path(), &WorkflowEvent::new("finished", serde_json::json!({})))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("_workflow/events.jsonl"))
            .await
            .unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn write_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = WorkflowRuntimeState::new(&def());
        write_state(dir.path(), &state).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("_workflow/state.json"))
            .await
            .unwrap();
        let parsed: WorkflowRuntimeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.status, state.status);
    }

    #[tokio::test]
    async fn debounced_writer_coalesces_rapid_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateWriter::new(dir.path().to_path_buf());
        for _ in 0..5 {
            writer.notify(WorkflowRuntimeState::new(&def())).await;
        }
        writer.flush().await;

        let raw = tokio::fs::read_to_string(dir.path().join("_workflow/state.json"))
            .await
            .unwrap();
        assert!(serde_json::from_str::<WorkflowRuntimeState>(&raw).is_ok());
    }
}
