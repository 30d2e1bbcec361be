//! The seam `roboppi-core` implements to wire the IPC server to the real
//! admission core (spec.md §4.13). Kept decoupled from `roboppi-admission`
//! and `roboppi-executor` the way `AdmissionPort`/`GatewayPort` keep the
//! DAG executor decoupled from its concrete dependencies.

use async_trait::async_trait;
use roboppi_common::{Job, JobId, PermitView, Rejection};

#[async_trait]
pub trait IpcHandler: Send + Sync {
    /// Accepts a job for eventual execution. The handler is expected to
    /// push a `job_completed`/`job_cancelled` notification later through
    /// whatever channel it was constructed with — this call only needs
    /// to return the id to ack.
    async fn submit_job(&self, job: Job) -> JobId;

    async fn request_permit(&self, job: Job, attempt_index: u32) -> Result<PermitView, Rejection>;

    /// Requests cancellation of an in-flight job. Returns once the
    /// request has been handed off; the actual cancellation is
    /// cooperative and its completion arrives later as `job_completed`.
    async fn cancel_job(&self, job_id: JobId, reason: String);

    /// Queue-depth telemetry from the scheduler peer. No response.
    fn report_queue_metrics(&self, queue_depth: u64, oldest_job_age_ms: u64, backlog_count: u64);
}
