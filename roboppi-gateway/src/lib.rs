//! Worker delegation gateway (spec.md §4.6-§4.7): per-kind CLI adapters
//! plus the gateway that runs the five-step delegation sequence against
//! whichever adapter a step's `worker_kind` names.

pub mod adapter;
pub mod commands;
pub mod events;
pub mod gateway;

pub use adapter::{CliAdapter, InlineAdapter, WorkerAdapter};
pub use events::WorkerEventStream;
pub use gateway::WorkerDelegationGateway;
