//! Worker task/handle/result data model (spec.md §3, §4.6).

use crate::activity::ActivitySink;
use crate::cancellation::CancelHandle;
use crate::error::ErrorClass;
use crate::ids::WorkerHandleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Which adapter a task is routed to. `Custom` carries the external
/// command name so operators can register arbitrary CLIs without a code
/// change (spec.md §6's workflow YAML schema names exactly these four).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    CodexCli,
    ClaudeCode,
    Opencode,
    Custom(String),
    /// Routes a `plugin_event` job (spec.md §3's job-kind list) to a
    /// no-op adapter that records an observation and resolves
    /// immediately — no subprocess involved (SPEC_FULL.md's plugin
    /// event/maintenance supplemental feature).
    Inline,
    /// Routes a `maintenance` job to a one-shot shell command run to
    /// completion, never streamed (same supplemental feature).
    Maintenance,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::CodexCli => write!(f, "codex_cli"),
            WorkerKind::ClaudeCode => write!(f, "claude_code"),
            WorkerKind::Opencode => write!(f, "opencode"),
            WorkerKind::Custom(name) => write!(f, "custom:{name}"),
            WorkerKind::Inline => write!(f, "inline"),
            WorkerKind::Maintenance => write!(f, "maintenance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Edit,
    RunTests,
    RunCommands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Stream,
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBudget {
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    pub max_steps: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_command_time: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub grace_period: Option<Duration>,
}

impl WorkerBudget {
    pub fn grace_period_or_default(&self) -> Duration {
        self.grace_period.unwrap_or(Duration::from_secs(10))
    }
}

/// A request to an adapter to run one external process (spec.md §3).
#[derive(Clone)]
pub struct WorkerTask {
    pub task_id: WorkerHandleId,
    pub worker_kind: WorkerKind,
    pub workspace: PathBuf,
    pub instructions: String,
    pub capabilities: HashSet<Capability>,
    pub output_mode: OutputMode,
    pub budget: WorkerBudget,
    pub abort: CancelHandle,
    /// Pinged once per worker event (stdout/stderr line, progress,
    /// patch) by the adapter driving this task. `None` unless a caller
    /// (the stall sentinel's no-output watcher, spec.md §4.12) wired one
    /// in before delegating.
    pub activity: Option<ActivitySink>,
}

/// Opaque reference returned by `startTask`.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerHandleId,
    pub worker_kind: WorkerKind,
    pub abort: CancelHandle,
}

/// One event in a worker's output stream. The stream is finite: it ends
/// when both stdout and stderr close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Stdout { bytes: Vec<u8> },
    Stderr { bytes: Vec<u8> },
    Progress { message: String, percent: Option<f32> },
    Patch { file_path: String, unified_diff: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub reference: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub wall_time: Duration,
    pub token_estimate: Option<u64>,
}

/// Terminal outcome of a worker task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    pub artifacts: Vec<Artifact>,
    pub observations: Vec<String>,
    pub cost: CostRecord,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub error_class: Option<ErrorClass>,
}

impl WorkerResult {
    pub fn cancelled(duration: Duration) -> Self {
        Self {
            status: WorkerStatus::Cancelled,
            artifacts: Vec::new(),
            observations: vec!["task cancelled".to_string()],
            cost: CostRecord {
                wall_time: duration,
                token_estimate: None,
            },
            duration,
            exit_code: None,
            error_class: None,
        }
    }

    pub fn failed(error_class: ErrorClass, observation: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed,
            artifacts: Vec::new(),
            observations: vec![observation.into()],
            cost: CostRecord {
                wall_time: Duration::ZERO,
                token_estimate: None,
            },
            duration: Duration::ZERO,
            exit_code: None,
            error_class: Some(error_class),
        }
    }

    /// Truncate `text` to a bounded head+tail per spec.md §7 ("head 800
    /// bytes + tail 800 bytes with elision marker if larger than 2000
    /// bytes").
    pub fn bound_tail(text: &str) -> String {
        const HEAD: usize = 800;
        const TAIL: usize = 800;
        const THRESHOLD: usize = 2000;
        let bytes = text.as_bytes();
        if bytes.len() <= THRESHOLD {
            return text.to_string();
        }
        let head = String::from_utf8_lossy(&bytes[..HEAD]);
        let tail = String::from_utf8_lossy(&bytes[bytes.len() - TAIL..]);
        format!("{head}\n...[elided {} bytes]...\n{tail}", bytes.len() - HEAD - TAIL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub handle_id: WorkerHandleId,
    pub worker_kind: WorkerKind,
    pub started_at: DateTime<Utc>,
}
