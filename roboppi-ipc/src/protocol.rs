//! Wire message shapes (spec.md §4.13, §6): one JSON object per line,
//! every message carries `type` and an optional `requestId`. Requests
//! flow scheduler → core; responses/notifications flow core → scheduler;
//! `error` can flow either way.

use roboppi_common::{Job, JobId, PermitView, Rejection, WorkerResult};
use serde::{Deserialize, Serialize};

/// Closed outcome set for `job_completed` (spec.md §9 edge case 8 uses
/// `outcome=cancelled` alongside `result.status=cancelled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<roboppi_common::WorkerStatus> for JobOutcome {
    fn from(status: roboppi_common::WorkerStatus) -> Self {
        match status {
            roboppi_common::WorkerStatus::Succeeded => JobOutcome::Succeeded,
            roboppi_common::WorkerStatus::Cancelled => JobOutcome::Cancelled,
            roboppi_common::WorkerStatus::Failed | roboppi_common::WorkerStatus::TimedOut => {
                JobOutcome::Failed
            }
        }
    }
}

/// A serializable view of an escalation event (spec.md §4.14), kept
/// independent of `roboppi-executor`'s internal `EscalationEvent` type so
/// this crate doesn't have to depend on the executor — `roboppi-core`
/// converts at the wiring boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEventView {
    pub scope: String,
    pub action: String,
    pub severity: String,
}

/// The full closed set of message shapes on the wire. One enum covers
/// both directions: the framing layer doesn't know in advance which
/// messages a given line could be, it just decodes `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // --- requests (scheduler -> core) ---
    SubmitJob {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        job: Job,
    },
    RequestPermit {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        job: Job,
        #[serde(rename = "attemptIndex")]
        attempt_index: u32,
    },
    CancelJob {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "jobId")]
        job_id: JobId,
        reason: String,
    },
    ReportQueueMetrics {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "queueDepth")]
        queue_depth: u64,
        #[serde(rename = "oldestJobAgeMs")]
        oldest_job_age_ms: u64,
        #[serde(rename = "backlogCount")]
        backlog_count: u64,
    },

    // --- responses / notifications (core -> scheduler) ---
    Ack {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    PermitGranted {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        permit: PermitView,
    },
    PermitRejected {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        rejection: Rejection,
    },
    JobCompleted {
        #[serde(rename = "jobId")]
        job_id: JobId,
        outcome: JobOutcome,
        result: WorkerResult,
    },
    JobCancelled {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "jobId")]
        job_id: JobId,
        reason: String,
    },
    Escalation {
        event: EscalationEventView,
    },
    Heartbeat {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    // --- either direction ---
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
}

impl Message {
    /// The `requestId` carried by this message, if any. Notifications
    /// that are never correlated (`job_completed`, `escalation`,
    /// `heartbeat`) have none.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::SubmitJob { request_id, .. }
            | Message::RequestPermit { request_id, .. }
            | Message::CancelJob { request_id, .. }
            | Message::ReportQueueMetrics { request_id, .. }
            | Message::Ack { request_id, .. }
            | Message::PermitGranted { request_id, .. }
            | Message::PermitRejected { request_id, .. }
            | Message::JobCancelled { request_id, .. }
            | Message::Error { request_id, .. } => request_id.as_deref(),
            Message::JobCompleted { .. } | Message::Escalation { .. } | Message::Heartbeat { .. } => None,
        }
    }

    pub fn error(request_id: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Error {
            request_id,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_common::{JobKind, JobLimits, Priority, PriorityClass};
    use std::time::Duration;

    #[test]
    fn submit_job_round_trips_through_json() {
        let job = Job::new(
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
        );
        let msg = Message::SubmitJob {
            request_id: Some("r1".to_string()),
            job,
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"submit_job\""));
        assert!(line.contains("\"requestId\":\"r1\""));
        let parsed: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.request_id(), Some("r1"));
    }

    #[test]
    fn job_completed_has_no_request_id() {
        let msg = Message::JobCompleted {
            job_id: JobId::new(),
            outcome: JobOutcome::Cancelled,
            result: WorkerResult::cancelled(Duration::from_millis(1)),
        };
        assert_eq!(msg.request_id(), None);
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains("requestId"));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"not_a_real_type"}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }
}
