#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
//! Subprocess lifecycle management (spec.md §4.5).
//!
//! Spawns worker CLIs, exposes their pid and raw stdio, and supervises
//! graceful-then-forced termination on cancellation or timeout. Line
//! framing and protocol parsing are left to `roboppi-gateway`, which
//! builds worker adapters on top of this crate.

mod error;
mod manager;

pub use error::{ProcessError, ProcessResult};
pub use manager::{ExitFuture, ExitOutcome, ProcessManager, SpawnOptions, SpawnedProcess};
