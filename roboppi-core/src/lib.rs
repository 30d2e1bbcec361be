//! Wiring crate: assembles `roboppi-admission`, `roboppi-gateway`,
//! `roboppi-executor`, `roboppi-sentinel`, and `roboppi-ipc` into the
//! `roboppi` supervisor binary. Everything here is glue — the control
//! plane's actual semantics live in those crates.

pub mod admission_core;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod metrics;

pub use admission_core::{AdmissionCore, PermitGateAdmission};
pub use config::RoboppiConfig;
pub use error::{CoreError, CoreResult};
pub use metrics::{MetricsCollector, MetricsSnapshot};
