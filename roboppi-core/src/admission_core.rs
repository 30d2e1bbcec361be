//! Wires `roboppi-admission::PermitGate` and
//! `roboppi-gateway::WorkerDelegationGateway` into the two seams the rest
//! of the workspace depends on: `roboppi-executor::AdmissionPort` (for
//! the in-process `run-workflow` path) and `roboppi-ipc::IpcHandler` (for
//! the `serve` path, spec.md §4.13). Grounded on
//! `roboppi-executor::dag::WorkflowExecutor`'s own `clone_refs` +
//! per-step spawn shape, generalized here from per-step tasks to
//! per-job tasks.

use crate::error::{CoreError, CoreResult};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use dashmap::DashMap;
use roboppi_admission::PermitGate;
use roboppi_common::{
    CancelHandle, CancelReason, Capability, ErrorClass, Job, JobId, OutputMode, Permit, PermitId,
    Rejection, WorkerBudget, WorkerHandleId, WorkerKind, WorkerResult, WorkerStatus, WorkerTask,
};
use roboppi_executor::ports::{AdmissionPort, GatewayPort};
use roboppi_executor::resilience::retry::{self, RetryConfig, RetryDecision};
use roboppi_gateway::WorkerDelegationGateway;
use roboppi_ipc::handler::IpcHandler;
use roboppi_ipc::protocol::{JobOutcome, Message};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Thin `AdmissionPort` wrapper around the permit gate, for
/// `WorkflowExecutor` in the `run-workflow` command. The IPC-facing
/// `AdmissionCore` below composes the same gate but also owns job
/// lifecycle and worker delegation; this wrapper exists because the DAG
/// executor calls `requestPermit`/`completePermit`/`revokePermit`
/// directly and has no notion of a job outside the one it's driving.
pub struct PermitGateAdmission {
    gate: Arc<PermitGate>,
    metrics: Arc<MetricsCollector>,
}

impl PermitGateAdmission {
    pub fn new(gate: Arc<PermitGate>, metrics: Arc<MetricsCollector>) -> Self {
        Self { gate, metrics }
    }
}

#[async_trait]
impl AdmissionPort for PermitGateAdmission {
    async fn request_permit(&self, job: &Job, attempt_index: u32) -> Result<Permit, Rejection> {
        let result = self.gate.request_permit(job, attempt_index);
        match &result {
            Ok(_) => self.metrics.record_permit_granted(),
            Err(_) => self.metrics.record_permit_rejected(),
        }
        result
    }

    fn complete_permit(&self, id: PermitId) {
        self.gate.complete_permit(id);
        self.metrics.record_permit_completed();
    }

    fn revoke_permit(&self, id: PermitId, reason: CancelReason) {
        self.gate.revoke_permit(id, reason);
        self.metrics.record_permit_revoked();
    }
}

/// The worker-kind/workspace/instructions shape a bare job's `payload`
/// must carry for `submit_job`/`request_permit` to turn it into a
/// `WorkerTask`. Workflow steps carry this on `StepSpec` instead; this
/// struct is only consulted for jobs submitted directly over IPC.
#[derive(Debug, Deserialize)]
struct JobPayload {
    worker_kind: WorkerKind,
    workspace: PathBuf,
    instructions: String,
    #[serde(default)]
    capabilities: HashSet<Capability>,
}

/// Builds the worker task a granted permit authorizes (spec.md §4.6).
/// `permit.deadline` already reflects the job's `limits.timeout`; any
/// clock skew between grant and this call is folded into `deadline`
/// rather than re-derived from `job.limits`.
fn job_to_worker_task(job: &Job, permit: &Permit) -> CoreResult<WorkerTask> {
    let payload: JobPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
    let deadline = (permit.deadline - chrono::Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
    Ok(WorkerTask {
        task_id: WorkerHandleId::new(),
        worker_kind: payload.worker_kind,
        workspace: payload.workspace,
        instructions: payload.instructions,
        capabilities: payload.capabilities,
        output_mode: OutputMode::Batch,
        budget: WorkerBudget {
            deadline,
            max_steps: None,
            max_command_time: None,
            grace_period: None,
        },
        abort: permit.cancel.clone(),
        activity: None,
    })
}

/// Maps a permit rejection to the error class the retry policy keys on.
/// `circuit-open` and `global-shed`/`deferred` behave like a transient
/// service failure: worth retrying within the job's attempt budget, not
/// worth retrying forever.
fn rejection_error_class(rejection: &Rejection) -> ErrorClass {
    match rejection {
        Rejection::RateLimit | Rejection::Deferred | Rejection::GlobalShed => {
            ErrorClass::RetryableRateLimit
        }
        Rejection::CircuitOpen { .. } => ErrorClass::RetryableService,
        Rejection::ConcurrencyLimit => ErrorClass::RetryableTransient,
        Rejection::AttemptsExhausted | Rejection::CostBudget => ErrorClass::NonRetryable,
    }
}

/// Implements `IpcHandler` for the `serve` command (spec.md §4.13):
/// accepts jobs and bare permit requests from a scheduler peer, drives
/// accepted jobs through the permit gate and worker gateway to
/// completion, and reports results as notifications.
pub struct AdmissionCore {
    gate: Arc<PermitGate>,
    gateway: Arc<WorkerDelegationGateway>,
    retry_config: RetryConfig,
    notifications: mpsc::UnboundedSender<Message>,
    metrics: Arc<MetricsCollector>,
    active_jobs: Arc<DashMap<JobId, CancelHandle>>,
}

impl AdmissionCore {
    pub fn new(
        gate: Arc<PermitGate>,
        gateway: Arc<WorkerDelegationGateway>,
        retry_config: RetryConfig,
        notifications: mpsc::UnboundedSender<Message>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            gate,
            gateway,
            retry_config,
            notifications,
            metrics,
            active_jobs: Arc::new(DashMap::new()),
        }
    }

    fn clone_refs(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            gateway: Arc::clone(&self.gateway),
            retry_config: self.retry_config,
            notifications: self.notifications.clone(),
            metrics: Arc::clone(&self.metrics),
            active_jobs: Arc::clone(&self.active_jobs),
        }
    }

    /// Runs `job` to a terminal `WorkerResult`, retrying admission
    /// rejections and worker failures per §4.10, then pushes
    /// `job_completed` on the notification channel. Never returns early
    /// on a send failure — the scheduler peer disconnecting doesn't stop
    /// the in-flight worker.
    async fn run_job(self, job: Job, cancel: CancelHandle) {
        let job_id = job.id;
        let started = std::time::Instant::now();
        let mut attempt_index = 0u32;

        let result = loop {
            if cancel.is_aborted() {
                break WorkerResult::cancelled(started.elapsed());
            }

            let permit = match self.gate.request_permit(&job, attempt_index) {
                Ok(permit) => {
                    self.metrics.record_permit_granted();
                    permit
                }
                Err(rejection) => {
                    self.metrics.record_permit_rejected();
                    match retry::decide(
                        &self.retry_config,
                        rejection_error_class(&rejection),
                        attempt_index,
                        job.limits.max_attempts,
                    ) {
                        RetryDecision::Retry { delay } => {
                            tokio::time::sleep(delay).await;
                            attempt_index += 1;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            break WorkerResult::failed(
                                ErrorClass::NonRetryable,
                                format!("admission rejected: {}", rejection.wire_code()),
                            );
                        }
                    }
                }
            };

            let task = match job_to_worker_task(&job, &permit) {
                Ok(task) => task,
                Err(e) => {
                    self.gate.complete_permit(permit.id);
                    self.metrics.record_permit_completed();
                    break WorkerResult::failed(ErrorClass::NonRetryable, e.to_string());
                }
            };

            let permit_id = permit.id;
            let gate_for_watch = Arc::clone(&self.gate);
            let cancel_watch = cancel.clone();
            let watcher = tokio::spawn(async move {
                cancel_watch.aborted().await;
                gate_for_watch.revoke_permit(permit_id, CancelReason::User);
            });

            self.metrics.record_worker_started();
            let attempt_result = self.gateway.delegate_task(task, &permit).await;
            watcher.abort();
            self.metrics.record_worker_finished();
            self.gate.complete_permit(permit.id);
            self.metrics.record_permit_completed();

            match attempt_result.status {
                WorkerStatus::Succeeded | WorkerStatus::Cancelled => break attempt_result,
                WorkerStatus::Failed | WorkerStatus::TimedOut => {
                    let class = attempt_result.error_class.unwrap_or(ErrorClass::NonRetryable);
                    match retry::decide(&self.retry_config, class, attempt_index, job.limits.max_attempts) {
                        RetryDecision::Retry { delay } => {
                            tokio::time::sleep(delay).await;
                            attempt_index += 1;
                            continue;
                        }
                        RetryDecision::GiveUp => break attempt_result,
                    }
                }
            }
        };

        self.active_jobs.remove(&job_id);
        let outcome = JobOutcome::from(result.status);
        if self
            .notifications
            .send(Message::JobCompleted {
                job_id,
                outcome,
                result,
            })
            .is_err()
        {
            warn!(%job_id, "notification channel closed, dropping job_completed");
        }
    }
}

#[async_trait]
impl IpcHandler for AdmissionCore {
    async fn submit_job(&self, job: Job) -> JobId {
        let job_id = job.id;
        let cancel = CancelHandle::new();
        self.active_jobs.insert(job_id, cancel.clone());
        let core = self.clone_refs();
        tokio::spawn(async move { core.run_job(job, cancel).await });
        job_id
    }

    /// Grants (or rejects) a permit without taking ownership of running
    /// the job — the scheduler peer is expected to drive execution
    /// itself and is responsible for eventually releasing the permit.
    /// No wire message exists to report that release explicitly (spec.md
    /// §6's closed message set has no `complete_permit`), so a permit
    /// granted this way is released only by its own deadline timer or by
    /// a later `cancel_job` naming the same job id.
    async fn request_permit(&self, job: Job, attempt_index: u32) -> Result<roboppi_common::PermitView, Rejection> {
        let permit = self.gate.request_permit(&job, attempt_index)?;
        self.metrics.record_permit_granted();
        let view = roboppi_common::PermitView::from(&permit);
        self.active_jobs.entry(job.id).or_insert_with(|| permit.cancel.clone());
        Ok(view)
    }

    async fn cancel_job(&self, job_id: JobId, reason: String) {
        if let Some(handle) = self.active_jobs.get(&job_id) {
            handle.fire(CancelReason::Other(reason));
        }
    }

    fn report_queue_metrics(&self, queue_depth: u64, oldest_job_age_ms: u64, backlog_count: u64) {
        tracing::debug!(queue_depth, oldest_job_age_ms, backlog_count, "queue metrics reported");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_admission::backpressure::{BackpressureController, BackpressureThresholds};
    use roboppi_admission::breaker_registry::CircuitBreakerRegistry;
    use roboppi_admission::budget::{BudgetLimits, ExecutionBudget};
    use roboppi_common::{JobKind, JobLimits, Priority, PriorityClass};
    use roboppi_process::ProcessManager;
    use std::time::Duration;

    fn gate() -> Arc<PermitGate> {
        Arc::new(PermitGate::new(
            Arc::new(ExecutionBudget::new(BudgetLimits {
                max_concurrency: 4,
                max_rps: 4,
                max_cost_budget: None,
            })),
            Arc::new(CircuitBreakerRegistry::new(3, Duration::from_secs(30))),
            Arc::new(
                BackpressureController::new(BackpressureThresholds {
                    degrade: 0.5,
                    defer: 0.75,
                    reject: 0.9,
                })
                .expect("thresholds are valid in this fixture"),
            ),
            Arc::new(|| 0.0),
        ))
    }

    fn job_with_payload(payload: serde_json::Value) -> Job {
        Job::new(
            JobKind::WorkerTask,
            Priority {
                value: 0,
                class: PriorityClass::Interactive,
            },
            payload,
            JobLimits {
                timeout: Duration::from_secs(30),
                max_attempts: 1,
                cost_hint: None,
            },
        )
    }

    #[tokio::test]
    async fn submit_job_reports_completion_for_inline_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let core = AdmissionCore::new(
            gate(),
            Arc::new(WorkerDelegationGateway::new(ProcessManager::new())),
            RetryConfig::default(),
            tx,
            MetricsCollector::new(),
        );

        let payload = serde_json::json!({
            "worker_kind": "inline",
            "workspace": "/",
            "instructions": "noop",
        });
        let job_id = core.submit_job(job_with_payload(payload)).await;

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("should complete promptly")
            .expect("channel open");
        match message {
            Message::JobCompleted { job_id: id, outcome, .. } => {
                assert_eq!(id, job_id);
                assert_eq!(outcome, JobOutcome::Succeeded);
            }
            other => panic!("expected job_completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_job_with_invalid_payload_fails_without_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let core = AdmissionCore::new(
            gate(),
            Arc::new(WorkerDelegationGateway::new(ProcessManager::new())),
            RetryConfig::default(),
            tx,
            MetricsCollector::new(),
        );

        let job_id = core.submit_job(job_with_payload(serde_json::json!({}))).await;

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("should complete promptly")
            .expect("channel open");
        match message {
            Message::JobCompleted { job_id: id, outcome, .. } => {
                assert_eq!(id, job_id);
                assert_eq!(outcome, JobOutcome::Failed);
            }
            other => panic!("expected job_completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_job_before_permit_reports_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let core = AdmissionCore::new(
            gate(),
            Arc::new(WorkerDelegationGateway::new(ProcessManager::new())),
            RetryConfig::default(),
            tx,
            MetricsCollector::new(),
        );

        let payload = serde_json::json!({
            "worker_kind": "inline",
            "workspace": "/",
            "instructions": "noop",
        });
        let job_id = core.submit_job(job_with_payload(payload)).await;
        core.cancel_job(job_id, "test".to_string()).await;

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("should complete promptly")
            .expect("channel open");
        match message {
            Message::JobCompleted { job_id: id, outcome, .. } => {
                assert_eq!(id, job_id);
                // Either the cancel won the race before a permit was
                // granted, or the inline worker finished first — both
                // are valid under spec.md §5's no-ordering-guarantee
                // rule across permits, so accept either outcome here.
                assert!(matches!(outcome, JobOutcome::Cancelled | JobOutcome::Succeeded));
            }
            other => panic!("expected job_completed, got {other:?}"),
        }
    }
}
