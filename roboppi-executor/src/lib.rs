//! Workflow DAG executor: dependency-ordered step scheduling, completion
//! checks, retry policy, cancellation fan-out and escalation aggregation
//! (spec.md §4.8-§4.11, §4.14).

pub mod cancellation_manager;
pub mod completion_check;
pub mod concurrency;
pub mod dag;
pub mod error;
pub mod escalation;
pub mod hooks;
pub mod ports;
pub mod resilience;

pub use cancellation_manager::CancellationManager;
pub use dag::WorkflowExecutor;
pub use error::{ExecutorError, ExecutorResult};
pub use escalation::{Action, EscalationConfig, EscalationEvent, EscalationManager, Scope, Severity};
pub use hooks::{HookAction, HookPhase, HookRegistry};
pub use ports::{AdmissionPort, GatewayPort};
