//! Backpressure controller: a load-derived signal that degrades, defers
//! or rejects work before it reaches the budget/breaker checks (spec.md
//! §4.3). Shaped after the teacher's threshold-validated SLO config
//! (`slo_admission.rs`), generalized from fixed latency ceilings to a
//! caller-supplied load signal in [0, 1].

use crate::error::{AdmissionError, AdmissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureLevel {
    Normal,
    Degrade,
    Defer,
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureThresholds {
    pub degrade: f64,
    pub defer: f64,
    pub reject: f64,
}

impl BackpressureThresholds {
    pub fn validate(&self) -> AdmissionResult<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.degrade) || !in_range(self.defer) || !in_range(self.reject) {
            return Err(AdmissionError::InvalidThresholds {
                degrade: self.degrade,
                defer: self.defer,
                reject: self.reject,
            });
        }
        if !(self.degrade <= self.defer && self.defer <= self.reject) {
            return Err(AdmissionError::InvalidThresholds {
                degrade: self.degrade,
                defer: self.defer,
                reject: self.reject,
            });
        }
        Ok(())
    }
}

pub struct BackpressureController {
    thresholds: BackpressureThresholds,
}

impl BackpressureController {
    pub fn new(thresholds: BackpressureThresholds) -> AdmissionResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// Classify a load signal in [0, 1] (spec.md §4.3).
    pub fn classify(&self, load: f64) -> BackpressureLevel {
        if load >= self.thresholds.reject {
            BackpressureLevel::Reject
        } else if load >= self.thresholds.defer {
            BackpressureLevel::Defer
        } else if load >= self.thresholds.degrade {
            BackpressureLevel::Degrade
        } else {
            BackpressureLevel::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn thresholds() -> BackpressureThresholds {
        BackpressureThresholds {
            degrade: 0.5,
            defer: 0.75,
            reject: 0.9,
        }
    }

    #[test]
    fn classifies_by_threshold() {
        let ctrl = BackpressureController::new(thresholds()).unwrap();
        assert_eq!(ctrl.classify(0.1), BackpressureLevel::Normal);
        assert_eq!(ctrl.classify(0.5), BackpressureLevel::Degrade);
        assert_eq!(ctrl.classify(0.8), BackpressureLevel::Defer);
        assert_eq!(ctrl.classify(0.95), BackpressureLevel::Reject);
    }

    #[test]
    fn rejects_out_of_order_thresholds() {
        let bad = BackpressureThresholds {
            degrade: 0.9,
            defer: 0.5,
            reject: 0.8,
        };
        assert!(BackpressureController::new(bad).is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let bad = BackpressureThresholds {
            degrade: -0.1,
            defer: 0.5,
            reject: 0.8,
        };
        assert!(BackpressureController::new(bad).is_err());
    }
}
