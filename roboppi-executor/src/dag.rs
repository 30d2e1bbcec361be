//! Workflow DAG executor (spec.md §4.8): runs steps in dependency order
//! with bounded parallelism over a single cooperative scheduling loop.
//! Grounded on the teacher's case/pattern execution shape
//! (`knhk-workflow-engine/src/case.rs`, `patterns.rs`), generalized from
//! fixed workflow patterns to an arbitrary step DAG, and on
//! `concurrency/nursery.rs`'s bounded-spawn idea — reimplemented here
//! with `FuturesUnordered` so the loop can react to "the earliest
//! finishing step" (spec.md §4.8) rather than waiting on a fixed batch.

use crate::cancellation_manager::CancellationManager;
use crate::completion_check::{self, CompletionMarker};
use crate::escalation::{EscalationEvent, EscalationManager};
use crate::hooks::{self, HookPhase, HookRegistry};
use crate::ports::{AdmissionPort, GatewayPort};
use crate::resilience::retry::{self, RetryConfig, RetryDecision};
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use roboppi_common::{
    CancelHandle, CancelReason, ErrorClass, Job, JobKind, JobLimits, ManagementHookOverride,
    OnFailure, OnIterationsExhausted, Priority, PriorityClass, StallPolicy, StepStatus,
    WorkerBudget, WorkerKind, WorkerResult, WorkerStatus, WorkerTask, WorkflowDefinition,
    WorkflowRuntimeState, WorkflowStatus,
};
use roboppi_sentinel::StallSentinel;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct WorkflowExecutor {
    admission: Arc<dyn AdmissionPort>,
    gateway: Arc<dyn GatewayPort>,
    cancellation: Arc<CancellationManager>,
    retry_config: RetryConfig,
    hooks: Arc<HookRegistry>,
    escalation: Arc<EscalationManager>,
    pending_escalations: Arc<Mutex<Vec<EscalationEvent>>>,
}

struct StepOutcome {
    step_id: String,
    status: StepStatus,
    error_class: Option<ErrorClass>,
    outputs: HashMap<String, serde_json::Value>,
}

impl WorkflowExecutor {
    pub fn new(admission: Arc<dyn AdmissionPort>, gateway: Arc<dyn GatewayPort>) -> Self {
        Self {
            admission,
            gateway,
            cancellation: Arc::new(CancellationManager::new()),
            retry_config: RetryConfig::default(),
            hooks: Arc::new(HookRegistry::default()),
            escalation: Arc::new(EscalationManager::new(Default::default())),
            pending_escalations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Swaps in a `HookRegistry` mapping management hook ids to their
    /// external commands (supplemental feature, spec.md §3/§6 — see
    /// `roboppi-core`'s config loader for where these are sourced from).
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Swaps in an `EscalationManager` built from operator-configured
    /// thresholds (spec.md §4.14) instead of the defaults.
    pub fn with_escalation(mut self, escalation: Arc<EscalationManager>) -> Self {
        self.escalation = escalation;
        self
    }

    /// Drains every escalation event emitted since the last call.
    /// `roboppi-core` polls this on a heartbeat interval and forwards
    /// each event as an IPC `escalation` notification.
    pub fn drain_escalations(&self) -> Vec<EscalationEvent> {
        std::mem::take(&mut self.pending_escalations.lock())
    }

    /// Run `workflow` to completion. `workspace_root` resolves each
    /// step's relative `workspace` field. `workflow_cancel` lets a caller
    /// broadcast a workflow-level cancellation (spec.md §4.8).
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        workspace_root: &std::path::Path,
        workflow_cancel: CancelHandle,
    ) -> WorkflowRuntimeState {
        let mut runtime = WorkflowRuntimeState::new(workflow);
        runtime.status = WorkflowStatus::Running;
        runtime.started_at = Some(Utc::now());

        let deadline = Instant::now() + workflow.timeout;
        let concurrency = workflow.concurrency.unwrap_or(usize::MAX);

        let mut done: HashSet<String> = HashSet::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut outputs_by_step: HashMap<String, HashMap<String, serde_json::Value>> =
            HashMap::new();
        let mut any_failed = false;
        let mut in_flight = FuturesUnordered::new();

        // `WorkflowDefinition::steps` is a map, so literal declaration
        // order isn't preserved; sort step ids for a stable, deterministic
        // tie-break among equally-ready steps instead.
        let mut declared_order: Vec<String> = workflow.steps.keys().cloned().collect();
        declared_order.sort();

        loop {
            if workflow_cancel.is_aborted() {
                for id in &declared_order {
                    if !done.contains(id) && !skipped.contains(id) {
                        if let Some(state) = runtime.steps.get_mut(id) {
                            state.status = StepStatus::Cancelled;
                        }
                    }
                }
                runtime.status = WorkflowStatus::Cancelled;
                break;
            }

            let ready: Vec<String> = declared_order
                .iter()
                .filter(|id| {
                    !done.contains(*id) && !skipped.contains(*id) && !running.contains(*id)
                })
                .filter(|id| {
                    let step = &workflow.steps[*id];
                    step.depends_on
                        .iter()
                        .all(|dep| done.contains(dep) || skipped.contains(dep))
                })
                .cloned()
                .collect();

            for id in ready {
                if running.len() >= concurrency {
                    break;
                }
                running.insert(id.clone());
                if let Some(state) = runtime.steps.get_mut(&id) {
                    state.status = StepStatus::Running;
                    state.started_at = Some(Utc::now());
                }
                let step = workflow.steps[&id].clone_for_run();
                let inputs = gather_inputs(&step.input_refs, &outputs_by_step);
                let remaining = deadline.saturating_duration_since(Instant::now());
                let step_cancel = workflow_cancel.child();
                let executor = self.clone_refs();
                let workspace_root = workspace_root.to_path_buf();
                let context_dir = workflow.context_dir.clone();
                let default_management = workflow.default_management.clone();
                let step_id = id.clone();
                in_flight.push(Box::pin(async move {
                    let outcome = executor
                        .run_step(
                            &step_id,
                            &step,
                            &workspace_root,
                            &context_dir,
                            &default_management,
                            inputs,
                            remaining,
                            step_cancel,
                        )
                        .await;
                    outcome
                }));
            }

            if in_flight.is_empty() {
                break;
            }

            if let Some(outcome) = in_flight.next().await {
                running.remove(&outcome.step_id);
                let step = &workflow.steps[&outcome.step_id];

                if let Some(state) = runtime.steps.get_mut(&outcome.step_id) {
                    state.status = outcome.status;
                    state.ended_at = Some(Utc::now());
                }
                outputs_by_step.insert(outcome.step_id.clone(), outcome.outputs.clone());

                match outcome.status {
                    StepStatus::Succeeded | StepStatus::Incomplete => {
                        done.insert(outcome.step_id.clone());
                    }
                    StepStatus::Failed => {
                        any_failed = true;
                        match step.on_failure {
                            OnFailure::Abort | OnFailure::Retry => {
                                skip_downstream(
                                    &outcome.step_id,
                                    workflow,
                                    &mut skipped,
                                    &done,
                                );
                                done.insert(outcome.step_id.clone());
                            }
                            OnFailure::Continue => {
                                done.insert(outcome.step_id.clone());
                            }
                        }
                    }
                    StepStatus::Cancelled => {
                        any_failed = true;
                        done.insert(outcome.step_id.clone());
                    }
                    _ => {
                        done.insert(outcome.step_id.clone());
                    }
                }
            }
        }

        for id in skipped {
            if let Some(state) = runtime.steps.get_mut(&id) {
                state.status = StepStatus::Skipped;
            }
        }

        if runtime.status != WorkflowStatus::Cancelled {
            runtime.status = if any_failed {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Succeeded
            };
        }
        runtime.ended_at = Some(Utc::now());
        runtime
    }

    fn clone_refs(&self) -> Self {
        Self {
            admission: Arc::clone(&self.admission),
            gateway: Arc::clone(&self.gateway),
            cancellation: Arc::clone(&self.cancellation),
            retry_config: self.retry_config,
            hooks: Arc::clone(&self.hooks),
            escalation: Arc::clone(&self.escalation),
            pending_escalations: Arc::clone(&self.pending_escalations),
        }
    }

    async fn run_step(
        &self,
        step_id: &str,
        step: &RunnableStep,
        workspace_root: &std::path::Path,
        context_dir: &Option<String>,
        default_management: &Option<ManagementHookOverride>,
        inputs: HashMap<String, serde_json::Value>,
        remaining: Duration,
        cancel: CancelHandle,
    ) -> StepOutcome {
        let step_dir = step_artifact_dir(workspace_root, context_dir, step_id);
        let before_hook = hooks::resolve_hook_id(&step.management, default_management, HookPhase::Before);
        let after_hook = hooks::resolve_hook_id(&step.management, default_management, HookPhase::After);

        if let Some(hook_id) = before_hook.as_deref() {
            if let Some(command) = self.hooks.command_for(hook_id) {
                let input = hooks::HookInput {
                    step_id,
                    phase: "before",
                    worker_kind: step.worker.to_string(),
                    instructions: &step.instructions,
                    trace_id: None,
                    correlation_id: None,
                    attempt_index: 0,
                };
                let action = hooks::run_hook(&step_dir, hook_id, command, HookPhase::Before, &input).await;
                if action == hooks::HookAction::Abort {
                    warn!(step_id, hook_id, "management hook aborted step before it ran");
                    return StepOutcome {
                        step_id: step_id.to_string(),
                        status: StepStatus::Failed,
                        error_class: Some(ErrorClass::NonRetryable),
                        outputs: HashMap::new(),
                    };
                }
            } else {
                warn!(step_id, hook_id, "no command registered for management hook id, degrading to proceed");
            }
        }

        let cancel_for_escalation = cancel.clone();
        let mut outcome = self
            .run_step_attempts(step_id, step, workspace_root, inputs, remaining, cancel, &step_dir)
            .await;

        if let Some(hook_id) = after_hook.as_deref() {
            if let Some(command) = self.hooks.command_for(hook_id) {
                let input = hooks::HookInput {
                    step_id,
                    phase: "after",
                    worker_kind: step.worker.to_string(),
                    instructions: &step.instructions,
                    trace_id: None,
                    correlation_id: None,
                    attempt_index: 0,
                };
                let action = hooks::run_hook(&step_dir, hook_id, command, HookPhase::After, &input).await;
                if action == hooks::HookAction::Abort {
                    warn!(step_id, hook_id, "management hook aborted step after it ran");
                    outcome.status = StepStatus::Failed;
                    outcome.error_class = Some(ErrorClass::NonRetryable);
                }
            } else {
                warn!(step_id, hook_id, "no command registered for management hook id, degrading to proceed");
            }
        }

        match outcome.status {
            StepStatus::Failed => {
                let events = self.escalation.record_crash(&step.worker);
                if !events.is_empty() {
                    self.pending_escalations.lock().extend(events);
                }
            }
            StepStatus::Cancelled
                if matches!(cancel_for_escalation.reason(), Some(CancelReason::Deadline)) =>
            {
                let events = self.escalation.record_cancel_timeout(&step.worker);
                self.pending_escalations.lock().extend(events);
            }
            _ => {}
        }

        outcome
    }

    async fn run_step_attempts(
        &self,
        step_id: &str,
        step: &RunnableStep,
        workspace_root: &std::path::Path,
        inputs: HashMap<String, serde_json::Value>,
        remaining: Duration,
        cancel: CancelHandle,
        step_dir: &std::path::Path,
    ) -> StepOutcome {
        let max_attempts = step.max_retries.unwrap_or(0) + 1;
        let mut attempt_index = 0u32;

        loop {
            let timeout = remaining.min(step.timeout);
            let payload = serde_json::json!({ "inputs": inputs.clone() });
            let job = Job::new(
                JobKind::WorkerTask,
                Priority {
                    value: 0,
                    class: PriorityClass::Interactive,
                },
                payload,
                JobLimits {
                    timeout,
                    max_attempts,
                    cost_hint: None,
                },
            );

            let permit = match self.admission.request_permit(&job, attempt_index).await {
                Ok(permit) => permit,
                Err(_rejection) => {
                    // Treat a permit rejection as a retryable-transient
                    // condition and back off before trying again
                    // (spec.md §4.8: "on rejection, apply the retry
                    // policy of §4.10").
                    match retry::decide(
                        &self.retry_config,
                        ErrorClass::RetryableTransient,
                        attempt_index,
                        max_attempts,
                    ) {
                        RetryDecision::Retry { delay } => {
                            tokio::time::sleep(delay).await;
                            attempt_index += 1;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            return StepOutcome {
                                step_id: step_id.to_string(),
                                status: StepStatus::Failed,
                                error_class: Some(ErrorClass::RetryableTransient),
                                outputs: HashMap::new(),
                            };
                        }
                    }
                }
            };

            link_cancellation(&cancel, &permit.cancel);
            self.cancellation
                .create_controller(permit.id, Some(job.id));

            let stall_watch = step
                .stall_policy
                .as_ref()
                .map(|policy| StallSentinel::watch(step_id, step_dir.to_path_buf(), policy, permit.cancel.clone()));
            let activity = stall_watch.as_ref().map(|watch| watch.activity_sink());

            let task = WorkerTask {
                task_id: roboppi_common::WorkerHandleId::new(),
                worker_kind: step.worker.clone(),
                workspace: workspace_root.join(&step.workspace),
                instructions: step.instructions.clone(),
                capabilities: step.capabilities.clone(),
                output_mode: roboppi_common::OutputMode::Stream,
                budget: WorkerBudget {
                    deadline: timeout,
                    max_steps: None,
                    max_command_time: None,
                    grace_period: None,
                },
                abort: permit.cancel.clone(),
                activity,
            };

            let mut result = self.gateway.delegate_task(task.clone(), &permit).await;
            let mut incomplete = false;

            if let Some(check) = &step.completion_check {
                let checked = self
                    .run_completion_check(step_id, check, &task, &permit, result)
                    .await;
                result = checked.0;
                incomplete = checked.1;
            }

            if let Some(watch) = stall_watch {
                watch.stop();
            }

            match result.status {
                WorkerStatus::Succeeded => {
                    self.admission.complete_permit(permit.id);
                    return StepOutcome {
                        step_id: step_id.to_string(),
                        status: if incomplete { StepStatus::Incomplete } else { StepStatus::Succeeded },
                        error_class: None,
                        outputs: collect_outputs(&step.output_names, &result),
                    };
                }
                WorkerStatus::Cancelled => {
                    self.admission.complete_permit(permit.id);
                    return StepOutcome {
                        step_id: step_id.to_string(),
                        status: StepStatus::Cancelled,
                        error_class: None,
                        outputs: HashMap::new(),
                    };
                }
                WorkerStatus::TimedOut | WorkerStatus::Failed => {
                    self.admission.complete_permit(permit.id);
                    let class = result.error_class.unwrap_or(ErrorClass::NonRetryable);
                    if class.is_fatal() {
                        return StepOutcome {
                            step_id: step_id.to_string(),
                            status: StepStatus::Failed,
                            error_class: Some(class),
                            outputs: HashMap::new(),
                        };
                    }
                    match retry::decide(&self.retry_config, class, attempt_index, max_attempts) {
                        RetryDecision::Retry { delay } => {
                            tokio::time::sleep(delay).await;
                            attempt_index += 1;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            return StepOutcome {
                                step_id: step_id.to_string(),
                                status: StepStatus::Failed,
                                error_class: Some(class),
                                outputs: HashMap::new(),
                            };
                        }
                    }
                }
            }
        }
    }

    /// Runs the completion-check loop (spec.md §4.9): after a successful
    /// worker run, a second task goes to the check worker with identical
    /// workspace; on INCOMPLETE the *original* worker re-runs with its
    /// same instructions (not the check alone) before the check runs
    /// again, up to `max_iterations`. Returns the terminal `WorkerResult`
    /// plus whether `on_iterations_exhausted: continue` applied — the
    /// caller maps that to `StepStatus::Incomplete` rather than
    /// `Succeeded`, since a worker result has no status of its own for
    /// it (spec.md §3's closed `WorkerResult` status set has no
    /// "incomplete" case; only `StepStatus` does).
    async fn run_completion_check(
        &self,
        step_id: &str,
        check: &roboppi_common::CompletionCheckSpec,
        worker_task: &WorkerTask,
        permit: &roboppi_common::Permit,
        mut worker_result: WorkerResult,
    ) -> (WorkerResult, bool) {
        if worker_result.status != WorkerStatus::Succeeded {
            return (worker_result, false);
        }

        let mut iteration = 0u32;
        loop {
            let check_task = WorkerTask {
                task_id: roboppi_common::WorkerHandleId::new(),
                worker_kind: check.worker.clone(),
                workspace: worker_task.workspace.clone(),
                instructions: check.instructions.clone(),
                capabilities: check.capabilities.clone(),
                output_mode: roboppi_common::OutputMode::Batch,
                budget: WorkerBudget {
                    deadline: Duration::from_secs(300),
                    max_steps: None,
                    max_command_time: None,
                    grace_period: None,
                },
                abort: permit.cancel.clone(),
                activity: None,
            };
            let check_result = self.gateway.delegate_task(check_task, permit).await;
            let marker = completion_check::scan(&check_result.observations);

            match marker {
                CompletionMarker::Complete => {
                    worker_result.status = WorkerStatus::Succeeded;
                    return (worker_result, false);
                }
                CompletionMarker::Fail => {
                    worker_result.status = WorkerStatus::Failed;
                    worker_result.error_class = Some(ErrorClass::NonRetryable);
                    return (worker_result, false);
                }
                CompletionMarker::Incomplete => {
                    iteration += 1;
                    if iteration < check.max_iterations {
                        info!(step_id, iteration, "completion check incomplete, re-running worker");
                        worker_result = self
                            .gateway
                            .delegate_task(worker_task.clone(), permit)
                            .await;
                        if worker_result.status != WorkerStatus::Succeeded {
                            return (worker_result, false);
                        }
                        continue;
                    }
                    return match check.on_iterations_exhausted {
                        OnIterationsExhausted::Continue => {
                            worker_result.status = WorkerStatus::Succeeded;
                            worker_result
                                .observations
                                .push("iterations exhausted, treated as incomplete".to_string());
                            (worker_result, true)
                        }
                        OnIterationsExhausted::Fail => {
                            warn!(step_id, "completion check iterations exhausted, failing step");
                            worker_result.status = WorkerStatus::Failed;
                            worker_result.error_class = Some(ErrorClass::NonRetryable);
                            (worker_result, false)
                        }
                    };
                }
            }
        }
    }
}

/// A step snapshot with everything `run_step` needs, cloned out of the
/// workflow definition so the scheduling loop can hold an immutable
/// borrow of `workflow` while a mutable future runs concurrently.
#[derive(Clone)]
struct RunnableStep {
    worker: WorkerKind,
    workspace: String,
    instructions: String,
    capabilities: HashSet<roboppi_common::Capability>,
    timeout: Duration,
    on_failure: OnFailure,
    max_retries: Option<u32>,
    input_refs: HashMap<String, roboppi_common::InputSource>,
    output_names: HashSet<String>,
    completion_check: Option<roboppi_common::CompletionCheckSpec>,
    stall_policy: Option<StallPolicy>,
    management: Option<ManagementHookOverride>,
}

trait StepSpecExt {
    fn clone_for_run(&self) -> RunnableStep;
}

impl StepSpecExt for roboppi_common::StepSpec {
    fn clone_for_run(&self) -> RunnableStep {
        RunnableStep {
            worker: self.worker.clone(),
            workspace: self.workspace.clone(),
            instructions: self.instructions.clone(),
            capabilities: self.capabilities.clone(),
            timeout: self.timeout,
            on_failure: self.on_failure,
            max_retries: self.max_retries,
            input_refs: self.inputs.clone(),
            output_names: self.outputs.clone(),
            completion_check: self.completion_check.clone(),
            stall_policy: self.stall_policy.clone(),
            management: self.management.clone(),
        }
    }
}

/// Per-step directory for stall events, patches, and management-hook
/// artifacts (spec.md §6), rooted under the workflow's `context_dir` (or
/// `.roboppi` if unset) rather than the step's own worker workspace, so
/// artifacts survive a workspace that gets wiped between retries.
fn step_artifact_dir(
    workspace_root: &std::path::Path,
    context_dir: &Option<String>,
    step_id: &str,
) -> std::path::PathBuf {
    workspace_root
        .join(context_dir.as_deref().unwrap_or(".roboppi"))
        .join(step_id)
}

fn gather_inputs(
    input_refs: &HashMap<String, roboppi_common::InputSource>,
    outputs_by_step: &HashMap<String, HashMap<String, serde_json::Value>>,
) -> HashMap<String, serde_json::Value> {
    let mut inputs = HashMap::new();
    for (name, source) in input_refs {
        if let Some(value) = outputs_by_step
            .get(&source.from)
            .and_then(|outs| outs.get(&source.output))
        {
            inputs.insert(name.clone(), value.clone());
        }
    }
    inputs
}

fn collect_outputs(
    names: &HashSet<String>,
    result: &WorkerResult,
) -> HashMap<String, serde_json::Value> {
    names
        .iter()
        .map(|name| {
            let matching = result
                .artifacts
                .iter()
                .find(|artifact| &artifact.reference == name)
                .and_then(|artifact| artifact.content.clone());
            (
                name.clone(),
                matching.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect()
}

/// Propagates a cancellation from `from` to `to` without making `to` a
/// structural child of `from` (they are created in different crates and
/// can't share a `children` list) — waits on `from` and fires `to` with
/// the same reason.
fn link_cancellation(from: &CancelHandle, to: &CancelHandle) {
    let from = from.clone();
    let to = to.clone();
    tokio::spawn(async move {
        from.clone().aborted_owned().await;
        let reason = from
            .reason()
            .unwrap_or(CancelReason::Other("upstream-cancelled".to_string()));
        to.fire(reason);
    });
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use async_trait::async_trait;
    use roboppi_common::{CostRecord, GrantedTokens, PermitId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysGrantAdmission;

    #[async_trait]
    impl AdmissionPort for AlwaysGrantAdmission {
        async fn request_permit(
            &self,
            job: &Job,
            attempt_index: u32,
        ) -> Result<roboppi_common::Permit, roboppi_common::Rejection> {
            Ok(roboppi_common::Permit {
                id: PermitId::new(),
                job_id: job.id,
                attempt_index,
                deadline: Utc::now() + chrono::Duration::seconds(60),
                tokens: GrantedTokens::new(None),
                breaker_snapshot: HashMap::new(),
                cancel: CancelHandle::new(),
            })
        }

        fn complete_permit(&self, _id: PermitId) {}
        fn revoke_permit(&self, _id: PermitId, _reason: CancelReason) {}
    }

    struct SucceedingGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GatewayPort for SucceedingGateway {
        async fn delegate_task(
            &self,
            _task: WorkerTask,
            _permit: &roboppi_common::Permit,
        ) -> WorkerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            WorkerResult {
                status: WorkerStatus::Succeeded,
                artifacts: Vec::new(),
                observations: Vec::new(),
                cost: CostRecord {
                    wall_time: Duration::from_millis(1),
                    token_estimate: None,
                },
                duration: Duration::from_millis(1),
                exit_code: Some(0),
                error_class: None,
            }
        }
    }

    fn step(deps: &[&str]) -> roboppi_common::StepSpec {
        roboppi_common::StepSpec {
            worker: WorkerKind::Opencode,
            workspace: "ws".into(),
            instructions: "do things".into(),
            capabilities: HashSet::new(),
            timeout: Duration::from_secs(5),
            on_failure: OnFailure::Abort,
            max_retries: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            inputs: HashMap::new(),
            outputs: HashSet::new(),
            completion_check: None,
            stall_policy: None,
            management: None,
        }
    }

    fn workflow(steps: Vec<(&str, roboppi_common::StepSpec)>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "t".into(),
            version: "1".into(),
            timeout: Duration::from_secs(60),
            concurrency: Some(2),
            context_dir: None,
            default_management: None,
            steps: steps.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    #[tokio::test]
    async fn linear_chain_runs_to_success() {
        let executor = WorkflowExecutor::new(
            Arc::new(AlwaysGrantAdmission),
            Arc::new(SucceedingGateway {
                calls: AtomicUsize::new(0),
            }),
        );
        let wf = workflow(vec![("a", step(&[])), ("b", step(&["a"]))]);
        let root = std::env::temp_dir();
        let state = executor.run(&wf, &root, CancelHandle::new()).await;
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(state.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(state.steps["b"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_step_skips_downstream() {
        struct FailingGateway;
        #[async_trait]
        impl GatewayPort for FailingGateway {
            async fn delegate_task(
                &self,
                _task: WorkerTask,
                _permit: &roboppi_common::Permit,
            ) -> WorkerResult {
                WorkerResult::failed(ErrorClass::NonRetryable, "boom")
            }
        }
        let executor =
            WorkflowExecutor::new(Arc::new(AlwaysGrantAdmission), Arc::new(FailingGateway));
        let wf = workflow(vec![("a", step(&[])), ("b", step(&["a"]))]);
        let root = std::env::temp_dir();
        let state = executor.run(&wf, &root, CancelHandle::new()).await;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.steps["a"].status, StepStatus::Failed);
        assert_eq!(state.steps["b"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn exhausted_completion_check_with_continue_yields_incomplete_status() {
        // Every delegated task (worker run or check run) reports success,
        // but the check's observations always read "INCOMPLETE" — forcing
        // the loop to run out its `max_iterations` budget.
        struct AlwaysIncompleteGateway;
        #[async_trait]
        impl GatewayPort for AlwaysIncompleteGateway {
            async fn delegate_task(
                &self,
                _task: WorkerTask,
                _permit: &roboppi_common::Permit,
            ) -> WorkerResult {
                WorkerResult {
                    status: WorkerStatus::Succeeded,
                    artifacts: Vec::new(),
                    observations: vec!["INCOMPLETE".to_string()],
                    cost: CostRecord {
                        wall_time: Duration::from_millis(1),
                        token_estimate: None,
                    },
                    duration: Duration::from_millis(1),
                    exit_code: Some(0),
                    error_class: None,
                }
            }
        }

        let mut with_check = step(&[]);
        with_check.completion_check = Some(roboppi_common::CompletionCheckSpec {
            worker: WorkerKind::Opencode,
            instructions: "check it".into(),
            capabilities: HashSet::new(),
            max_iterations: 2,
            on_iterations_exhausted: OnIterationsExhausted::Continue,
        });

        let executor = WorkflowExecutor::new(
            Arc::new(AlwaysGrantAdmission),
            Arc::new(AlwaysIncompleteGateway),
        );
        let wf = workflow(vec![("a", with_check)]);
        let root = std::env::temp_dir();
        let state = executor.run(&wf, &root, CancelHandle::new()).await;

        assert_eq!(state.steps["a"].status, StepStatus::Incomplete);
        // An exhausted-but-continue step is success-like for the
        // workflow's overall terminal status (spec.md §4.9).
        assert_eq!(state.status, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn workflow_cancel_marks_remaining_steps_cancelled() {
        // Models a worker adapter that honors the task's abort handle
        // instead of ignoring it, the way a real gateway must.
        struct CancelAwareGateway;
        #[async_trait]
        impl GatewayPort for CancelAwareGateway {
            async fn delegate_task(
                &self,
                task: WorkerTask,
                _permit: &roboppi_common::Permit,
            ) -> WorkerResult {
                task.abort.aborted().await;
                WorkerResult::cancelled(Duration::from_millis(1))
            }
        }
        let executor =
            WorkflowExecutor::new(Arc::new(AlwaysGrantAdmission), Arc::new(CancelAwareGateway));
        let wf = workflow(vec![("a", step(&[]))]);
        let root = std::env::temp_dir();
        let cancel = CancelHandle::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.fire(CancelReason::User);
        });
        let state = tokio::time::timeout(Duration::from_secs(5), executor.run(&wf, &root, cancel))
            .await
            .expect("workflow should react to cancellation promptly");
        assert_eq!(state.steps["a"].status, StepStatus::Cancelled);
    }
}

fn skip_downstream(
    failed_step: &str,
    workflow: &WorkflowDefinition,
    skipped: &mut HashSet<String>,
    done: &HashSet<String>,
) {
    let mut frontier = vec![failed_step.to_string()];
    while let Some(id) = frontier.pop() {
        for (candidate_id, candidate) in &workflow.steps {
            if candidate.depends_on.contains(&id)
                && !done.contains(candidate_id)
                && skipped.insert(candidate_id.clone())
            {
                frontier.push(candidate_id.clone());
            }
        }
    }
}
