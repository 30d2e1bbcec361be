//! Job — the unit of work submitted through IPC (spec.md §3).

use crate::ids::JobId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The kind of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ModelCall,
    WorkerTask,
    Tool,
    PluginEvent,
    Maintenance,
}

/// Scheduling class. `Interactive` jobs are preferred by a scheduler peer
/// over `Batch` jobs when both compete for the same admission budget;
/// the core itself treats `priority` as an opaque ordering hint and does
/// not reorder the ready set by it (spec.md §4.8 schedules in declaration
/// order within the ready set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Interactive,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    pub value: i32,
    pub class: PriorityClass,
}

/// Resource limits attached to a job at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLimits {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Opaque cost hint (e.g. an estimated token count); `None` means the
    /// job does not participate in the optional cost budget.
    pub cost_hint: Option<f64>,
}

/// Trace/correlation context threaded through for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContext {
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// A unit of work submitted through IPC. Immutable after submission —
/// every field is set at construction and never mutated; attempts are
/// tracked out-of-band by the attempt index on `canIssue`/permits, not by
/// mutating the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub limits: JobLimits,
    pub context: JobContext,
}

impl Job {
    pub fn new(kind: JobKind, priority: Priority, payload: serde_json::Value, limits: JobLimits) -> Self {
        Self {
            id: JobId::new(),
            kind,
            priority,
            payload,
            limits,
            context: JobContext::default(),
        }
    }
}
