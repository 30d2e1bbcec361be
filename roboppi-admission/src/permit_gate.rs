//! Permit gate: composes the execution budget, circuit breaker registry,
//! and backpressure controller into a single `request_permit` entry
//! point (spec.md §4.4).

use crate::backpressure::{BackpressureController, BackpressureLevel};
use crate::breaker_registry::CircuitBreakerRegistry;
use crate::budget::{BudgetRejection, ExecutionBudget};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use roboppi_common::{CancelHandle, CancelReason, GrantedTokens, Job, Permit, PermitId, Rejection};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ActiveEntry {
    permit: Permit,
    deadline_timer: JoinHandle<()>,
}

/// The permit gate (spec.md §4.4). Owns the active-permit set and
/// schedules each permit's deadline timer.
pub struct PermitGate {
    budget: Arc<ExecutionBudget>,
    breakers: Arc<CircuitBreakerRegistry>,
    backpressure: Arc<BackpressureController>,
    active: Arc<DashMap<PermitId, ActiveEntry>>,
    load_signal: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl PermitGate {
    pub fn new(
        budget: Arc<ExecutionBudget>,
        breakers: Arc<CircuitBreakerRegistry>,
        backpressure: Arc<BackpressureController>,
        load_signal: Arc<dyn Fn() -> f64 + Send + Sync>,
    ) -> Self {
        Self {
            budget,
            breakers,
            backpressure,
            active: Arc::new(DashMap::new()),
            load_signal,
        }
    }

    /// spec.md §4.4 `requestPermit`.
    pub fn request_permit(&self, job: &Job, attempt_index: u32) -> Result<Permit, Rejection> {
        match self.backpressure.classify((self.load_signal)()) {
            BackpressureLevel::Reject => return Err(Rejection::GlobalShed),
            BackpressureLevel::Defer => return Err(Rejection::Deferred),
            BackpressureLevel::Degrade => debug!(job_id = %job.id, "admitting in degraded mode"),
            BackpressureLevel::Normal => {}
        }

        // Re-read the breaker snapshot fresh on every call, including
        // retries (spec.md §9's open-question resolution — never cache
        // a prior attempt's snapshot).
        let snapshot = self.breakers.snapshot();
        for (provider, state) in &snapshot {
            if *state == roboppi_common::BreakerState::Open {
                return Err(Rejection::CircuitOpen {
                    provider: provider.clone(),
                });
            }
        }

        self.budget
            .can_issue(attempt_index, job.limits.max_attempts, job.limits.cost_hint)
            .map_err(budget_rejection_to_wire)?;

        let cancel = CancelHandle::new();
        let deadline = Utc::now()
            + ChronoDuration::from_std(job.limits.timeout).unwrap_or(ChronoDuration::seconds(0));
        let permit = Permit {
            id: PermitId::new(),
            job_id: job.id,
            attempt_index,
            deadline,
            tokens: GrantedTokens::new(job.limits.cost_hint),
            breaker_snapshot: snapshot,
            cancel: cancel.clone(),
        };

        if !self
            .budget
            .consume(attempt_index, job.limits.max_attempts, job.limits.cost_hint)
        {
            return Err(Rejection::RateLimit);
        }

        let permit_id = permit.id;
        let active = Arc::clone(&self.active);
        let cost_hint = job.limits.cost_hint;
        let budget = Arc::clone(&self.budget);
        let timer_cancel = cancel.clone();
        let timer_delay = job.limits.timeout;
        let deadline_timer = tokio::spawn(async move {
            tokio::time::sleep(timer_delay).await;
            if active.remove(&permit_id).is_some() {
                warn!(%permit_id, "permit deadline fired, revoking");
                timer_cancel.fire(CancelReason::Deadline);
                budget.release(cost_hint);
            }
        });

        self.active.insert(
            permit_id,
            ActiveEntry {
                permit: permit.clone(),
                deadline_timer,
            },
        );
        Ok(permit)
    }

    /// spec.md §4.4 `revokePermit`. Idempotent.
    pub fn revoke_permit(&self, id: PermitId, reason: CancelReason) {
        if let Some((_, entry)) = self.active.remove(&id) {
            entry.deadline_timer.abort();
            entry.permit.cancel.fire(reason);
            self.budget.release(entry.permit.tokens.cost);
        }
    }

    /// spec.md §4.4 `completePermit`: like revoke, but without firing the
    /// cancellation handle — signals normal termination.
    pub fn complete_permit(&self, id: PermitId) {
        if let Some((_, entry)) = self.active.remove(&id) {
            entry.deadline_timer.abort();
            self.budget.release(entry.permit.tokens.cost);
        }
    }

    /// spec.md §4.4 `dispose`: clear all timers and cancel every still
    /// active permit.
    pub fn dispose(&self) {
        let ids: Vec<PermitId> = self.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.revoke_permit(id, CancelReason::Other("gate-disposed".to_string()));
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn budget_rejection_to_wire(r: BudgetRejection) -> Rejection {
    Rejection::from(r)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::backpressure::BackpressureThresholds;
    use roboppi_common::{JobKind, JobLimits, Priority, PriorityClass};
    use std::time::Duration as StdDuration;

    fn gate() -> PermitGate {
        PermitGate::new(
            Arc::new(ExecutionBudget::new(crate::budget::BudgetLimits {
                max_concurrency: 4,
                max_rps: 4,
                max_cost_budget: None,
            })),
            Arc::new(CircuitBreakerRegistry::new(3, StdDuration::from_secs(30))),
            Arc::new(
                BackpressureController::new(BackpressureThresholds {
                    degrade: 0.5,
                    defer: 0.75,
                    reject: 0.9,
                })
                .unwrap(),
            ),
            Arc::new(|| 0.0),
        )
    }

    fn job() -> Job {
        Job::new(
            JobKind::WorkerTask,
            Priority {
                value: 0,
                class: PriorityClass::Interactive,
            },
            serde_json::json!({}),
            JobLimits {
                timeout: StdDuration::from_secs(60),
                max_attempts: 3,
                cost_hint: None,
            },
        )
    }

    #[tokio::test]
    async fn grants_permit_under_normal_load() {
        let gate = gate();
        let permit = gate.request_permit(&job(), 0).unwrap();
        assert_eq!(gate.active_count(), 1);
        gate.complete_permit(permit.id);
        assert_eq!(gate.active_count(), 0);
    }

    #[tokio::test]
    async fn rejects_when_circuit_open() {
        let gate = gate();
        gate.breakers.record_failure("p1");
        gate.breakers.record_failure("p1");
        gate.breakers.record_failure("p1");
        let err = gate.request_permit(&job(), 0).unwrap_err();
        assert!(matches!(err, Rejection::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn revoke_fires_cancellation_and_releases_budget() {
        let gate = gate();
        let permit = gate.request_permit(&job(), 0).unwrap();
        let cancel = permit.cancel.clone();
        gate.revoke_permit(permit.id, CancelReason::User);
        assert!(cancel.is_aborted());
        assert_eq!(gate.budget.active_slots(), 0);
    }

    #[tokio::test]
    async fn attempts_exhausted_is_rejected() {
        let gate = gate();
        let err = gate.request_permit(&job(), 3).unwrap_err();
        assert_eq!(err.wire_code(), "budget-exhausted");
    }
}
