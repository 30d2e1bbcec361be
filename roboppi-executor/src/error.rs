//! Error types for the workflow DAG executor.

use thiserror::Error;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("invalid workflow specification: {0}")]
    InvalidSpecification(String),

    #[error("step {0:?} not found")]
    StepNotFound(String),

    #[error("gateway delegation failed: {0}")]
    DelegationFailed(String),

    #[error("workflow timed out")]
    Timeout,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<roboppi_common::CommonError> for ExecutorError {
    fn from(err: roboppi_common::CommonError) -> Self {
        ExecutorError::InvalidSpecification(err.to_string())
    }
}
