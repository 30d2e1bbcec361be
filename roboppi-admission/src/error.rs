//! Error type for the admission crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("negative amount supplied to budget: {0}")]
    NegativeAmount(String),

    #[error("unknown permit id: {0}")]
    UnknownPermit(uuid::Uuid),

    #[error("invalid backpressure thresholds: degrade={degrade}, defer={defer}, reject={reject}")]
    InvalidThresholds {
        degrade: f64,
        defer: f64,
        reject: f64,
    },
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
