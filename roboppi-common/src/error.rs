//! Closed error taxonomy (spec.md §3, §7) and the common-level error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error classes. Every terminal [`crate::worker::WorkerResult`]
/// and retry/escalation decision is driven strictly by this classification —
/// nothing downstream inspects error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    RetryableTransient,
    RetryableRateLimit,
    RetryableNetwork,
    RetryableService,
    NonRetryable,
    NonRetryableLint,
    NonRetryableTest,
    Fatal,
}

impl ErrorClass {
    /// Whether the retry policy (spec.md §4.10) should ever retry this class.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RetryableTransient
                | ErrorClass::RetryableRateLimit
                | ErrorClass::RetryableNetwork
                | ErrorClass::RetryableService
        )
    }

    /// Whether this class overrides a step's `on_failure` policy and
    /// forces abort with no retry (spec.md §4.8).
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Fatal)
    }
}

/// Errors local to `roboppi-common` itself: validation and config parsing.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("validation failed at {path}: {message}")]
    Validation { path: String, message: String },

    #[error("negative cost or token amount supplied: {0}")]
    NegativeAmount(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type CommonResult<T> = Result<T, CommonError>;
