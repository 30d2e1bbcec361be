//! Circuit breaker state shared between the admission crate (which owns
//! the registry) and the permit gate / callers that need a read-only
//! snapshot (spec.md §3, §4.2).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

/// Provider or logical-group identifier a breaker is keyed on.
pub type ProviderId = String;

/// An atomic point-in-time snapshot of every breaker's state, as handed
/// to the permit gate on each `requestPermit` call.
pub type BreakerSnapshot = HashMap<ProviderId, BreakerState>;
