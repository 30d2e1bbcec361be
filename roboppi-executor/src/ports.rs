//! Seams the DAG executor depends on but does not implement: admission
//! control and worker delegation. `roboppi-core` wires concrete
//! `roboppi-admission::PermitGate` / `roboppi-gateway` implementations
//! into these traits; the executor itself stays decoupled from both, the
//! way the teacher's workflow engine depends on connector traits rather
//! than concrete connector types.

use async_trait::async_trait;
use roboppi_common::{CancelReason, Job, Permit, PermitId, Rejection, WorkerResult, WorkerTask};

#[async_trait]
pub trait AdmissionPort: Send + Sync {
    async fn request_permit(&self, job: &Job, attempt_index: u32) -> Result<Permit, Rejection>;
    fn complete_permit(&self, id: PermitId);
    fn revoke_permit(&self, id: PermitId, reason: CancelReason);
}

#[async_trait]
pub trait GatewayPort: Send + Sync {
    async fn delegate_task(&self, task: WorkerTask, permit: &Permit) -> WorkerResult;
}
