//! Shared types for the roboppi control plane: job/permit/worker/workflow
//! data model, cancellation handles, and the closed error taxonomy.
//!
//! This crate has no I/O of its own — every other crate in the workspace
//! depends on it for the vocabulary they speak over IPC and between
//! subsystems.

pub mod activity;
pub mod breaker;
pub mod cancellation;
pub mod error;
pub mod ids;
pub mod job;
pub mod permit;
pub mod worker;
pub mod workflow;

pub use activity::ActivitySink;
pub use breaker::{BreakerSnapshot, BreakerState, ProviderId};
pub use cancellation::{CancelHandle, CancelReason};
pub use error::{CommonError, CommonResult, ErrorClass};
pub use ids::{JobId, PermitId, WorkerHandleId};
pub use job::{Job, JobContext, JobKind, JobLimits, Priority, PriorityClass};
pub use permit::{GrantedTokens, Permit, PermitView, Rejection};
pub use worker::{
    Artifact, Capability, CostRecord, OutputMode, WorkerBudget, WorkerEvent, WorkerHandle,
    WorkerKind, WorkerRecord, WorkerResult, WorkerStatus, WorkerTask,
};
pub use workflow::{
    CompletionCheckSpec, InputSource, ManagementHookOverride, NoOutputSource, OnFailure,
    OnIterationsExhausted, ProbeErrorAction, StallAction, StallPolicy, StepRuntimeState,
    StepSpec, StepStatus, WorkflowDefinition, WorkflowRuntimeState, WorkflowStatus,
};
