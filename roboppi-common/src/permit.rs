//! Permit — a time-bounded, revocable right to run one attempt of a job
//! (spec.md §3, §4.4).

use crate::breaker::BreakerSnapshot;
use crate::cancellation::CancelHandle;
use crate::ids::{JobId, PermitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tokens granted to a permit at issue time. `concurrency` and `rps` are
/// always 1 (one attempt consumes exactly one slot and one rate-window
/// entry); `cost` mirrors the job's cost hint, if any.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrantedTokens {
    pub concurrency: u32,
    pub rps: u32,
    pub cost: Option<f64>,
}

impl GrantedTokens {
    pub fn new(cost: Option<f64>) -> Self {
        Self {
            concurrency: 1,
            rps: 1,
            cost,
        }
    }
}

/// A granted permit. Owned exclusively by the permit gate; the consumer
/// (the workflow executor, via the gateway) holds a borrowed reference
/// until it calls back into `completePermit`/`revokePermit`.
#[derive(Clone)]
pub struct Permit {
    pub id: PermitId,
    pub job_id: JobId,
    pub attempt_index: u32,
    pub deadline: DateTime<Utc>,
    pub tokens: GrantedTokens,
    pub breaker_snapshot: BreakerSnapshot,
    pub cancel: CancelHandle,
}

/// A serializable view of a permit with the cancellation handle stripped,
/// for the `permit_granted` IPC notification (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitView {
    pub id: PermitId,
    pub job_id: JobId,
    pub attempt_index: u32,
    pub deadline: DateTime<Utc>,
    pub tokens_cost: Option<f64>,
}

impl From<&Permit> for PermitView {
    fn from(p: &Permit) -> Self {
        Self {
            id: p.id,
            job_id: p.job_id,
            attempt_index: p.attempt_index,
            deadline: p.deadline,
            tokens_cost: p.tokens.cost,
        }
    }
}

/// Closed set of rejection reasons (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "reason")]
pub enum Rejection {
    AttemptsExhausted,
    ConcurrencyLimit,
    RateLimit,
    CostBudget,
    CircuitOpen { provider: String },
    GlobalShed,
    Deferred,
}

impl Rejection {
    /// The stable reason code used on the wire (spec.md §6's closed set:
    /// concurrency-limit, rate-limit, budget-exhausted, circuit-open,
    /// global-shed, deferred). `attempts-exhausted`/`cost-budget` are
    /// internal §4.1 reasons folded into `budget-exhausted` on the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Rejection::AttemptsExhausted | Rejection::CostBudget => "budget-exhausted",
            Rejection::ConcurrencyLimit => "concurrency-limit",
            Rejection::RateLimit => "rate-limit",
            Rejection::CircuitOpen { .. } => "circuit-open",
            Rejection::GlobalShed => "global-shed",
            Rejection::Deferred => "deferred",
        }
    }
}
