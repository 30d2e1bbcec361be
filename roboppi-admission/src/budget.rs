//! Execution budget: concurrency slots, a rolling-window rate limit, and an
//! optional cumulative cost ceiling (spec.md §4.1).
//!
//! The rate window is a ring buffer of timestamps sized `max_rps + 1`;
//! `count_in_window` evicts entries older than `now - 1s` from the front
//! before counting. `consume` re-checks both limits under the same lock
//! that performs the increment — this closes the TOCTOU race the earlier
//! source's separate check-then-consume calls left open (spec.md §9,
//! "budget atomicity").

use parking_lot::Mutex;
use roboppi_common::Rejection;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    pub max_concurrency: u32,
    pub max_rps: u32,
    pub max_cost_budget: Option<f64>,
}

struct BudgetState {
    active_slots: u32,
    rate_window: VecDeque<Instant>,
    cumulative_cost: f64,
}

/// Thread-safe execution budget tracker. One instance guards one logical
/// resource pool (e.g. one provider, or the process-wide default pool).
pub struct ExecutionBudget {
    limits: BudgetLimits,
    state: Mutex<BudgetState>,
}

/// What `can_issue`/`consume` found insufficient. A strict subset of
/// [`Rejection`] — the budget never produces circuit/backpressure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetRejection {
    AttemptsExhausted,
    ConcurrencyLimit,
    RateLimit,
    CostBudget,
}

impl From<BudgetRejection> for Rejection {
    fn from(r: BudgetRejection) -> Self {
        match r {
            BudgetRejection::AttemptsExhausted => Rejection::AttemptsExhausted,
            BudgetRejection::ConcurrencyLimit => Rejection::ConcurrencyLimit,
            BudgetRejection::RateLimit => Rejection::RateLimit,
            BudgetRejection::CostBudget => Rejection::CostBudget,
        }
    }
}

impl ExecutionBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState {
                active_slots: 0,
                rate_window: VecDeque::with_capacity(limits.max_rps as usize + 1),
                cumulative_cost: 0.0,
            }),
        }
    }

    /// Non-mutating admission check (spec.md §4.1 `canIssue`).
    pub fn can_issue(
        &self,
        attempt_index: u32,
        max_attempts: u32,
        cost_hint: Option<f64>,
    ) -> Result<(), BudgetRejection> {
        if attempt_index >= max_attempts {
            return Err(BudgetRejection::AttemptsExhausted);
        }
        let mut state = self.state.lock();
        evict_expired(&mut state.rate_window);

        if state.active_slots >= self.limits.max_concurrency {
            return Err(BudgetRejection::ConcurrencyLimit);
        }
        if state.rate_window.len() as u32 >= self.limits.max_rps {
            return Err(BudgetRejection::RateLimit);
        }
        if let (Some(max_cost), Some(hint)) = (self.limits.max_cost_budget, cost_hint) {
            if state.cumulative_cost + hint > max_cost {
                return Err(BudgetRejection::CostBudget);
            }
        }
        Ok(())
    }

    /// Atomic check-and-apply (spec.md §4.1 `consume`). Returns `false`
    /// (and applies nothing) if either the rate or cost check fails under
    /// the same critical section as the increment.
    pub fn consume(&self, attempt_index: u32, max_attempts: u32, cost_hint: Option<f64>) -> bool {
        if attempt_index >= max_attempts {
            return false;
        }
        let mut state = self.state.lock();
        evict_expired(&mut state.rate_window);

        if state.active_slots >= self.limits.max_concurrency {
            return false;
        }
        if state.rate_window.len() as u32 >= self.limits.max_rps {
            return false;
        }
        if let (Some(max_cost), Some(hint)) = (self.limits.max_cost_budget, cost_hint) {
            if state.cumulative_cost + hint > max_cost {
                return false;
            }
        }

        state.active_slots += 1;
        state.rate_window.push_back(Instant::now());
        if let Some(hint) = cost_hint {
            debug_assert!(hint >= 0.0, "negative cost hint must be rejected earlier");
            state.cumulative_cost += hint;
        }
        true
    }

    /// Decrements active slots and cumulative cost (floor 0) by the
    /// granted amounts (spec.md §4.1 `release`).
    pub fn release(&self, cost_hint: Option<f64>) {
        let mut state = self.state.lock();
        state.active_slots = state.active_slots.saturating_sub(1);
        if let Some(hint) = cost_hint {
            state.cumulative_cost = (state.cumulative_cost - hint).max(0.0);
        }
    }

    pub fn active_slots(&self) -> u32 {
        self.state.lock().active_slots
    }
}

fn evict_expired(window: &mut VecDeque<Instant>) {
    let cutoff = Instant::now() - Duration::from_secs(1);
    while matches!(window.front(), Some(ts) if *ts < cutoff) {
        window.pop_front();
    }
}

/// Construct a budget from a non-negative cost hint, rejecting loudly on
/// a negative input (spec.md §4.1: "negative cost inputs are a
/// programming error and must fail loudly").
pub fn validate_cost_hint(cost_hint: Option<f64>) -> Result<(), super::error::AdmissionError> {
    if let Some(hint) = cost_hint {
        if hint < 0.0 {
            return Err(super::error::AdmissionError::NegativeAmount(format!(
                "cost hint {hint} is negative"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn limits() -> BudgetLimits {
        BudgetLimits {
            max_concurrency: 2,
            max_rps: 2,
            max_cost_budget: Some(10.0),
        }
    }

    #[test]
    fn can_issue_allows_within_limits() {
        let budget = ExecutionBudget::new(limits());
        assert!(budget.can_issue(0, 3, Some(1.0)).is_ok());
    }

    #[test]
    fn attempts_exhausted_is_checked_first() {
        let budget = ExecutionBudget::new(limits());
        assert_eq!(
            budget.can_issue(3, 3, None),
            Err(BudgetRejection::AttemptsExhausted)
        );
    }

    #[test]
    fn consume_is_atomic_and_rejects_over_concurrency() {
        let budget = ExecutionBudget::new(limits());
        assert!(budget.consume(0, 5, None));
        assert!(budget.consume(0, 5, None));
        // third concurrent consume exceeds max_concurrency=2
        assert!(!budget.consume(0, 5, None));
        assert_eq!(budget.active_slots(), 2);
    }

    #[test]
    fn release_floors_at_zero() {
        let budget = ExecutionBudget::new(limits());
        budget.release(None);
        assert_eq!(budget.active_slots(), 0);
    }

    #[test]
    fn cost_budget_rejects_when_exceeded() {
        let budget = ExecutionBudget::new(limits());
        assert!(budget.consume(0, 5, Some(9.0)));
        assert!(!budget.consume(0, 5, Some(2.0)));
    }
}
