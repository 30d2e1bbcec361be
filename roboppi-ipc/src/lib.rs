//! Supervisor IPC protocol (spec.md §4.13): line-delimited JSON
//! request/response framing between a scheduler peer and the core, with
//! requestId correlation and a dispatch loop that never stops on a
//! malformed message or a handler failure.

pub mod correlator;
pub mod error;
pub mod framing;
pub mod handler;
pub mod protocol;
pub mod server;

pub use correlator::Correlator;
pub use error::{IpcError, IpcResult};
pub use framing::{FrameReader, FrameWriter, MAX_LINE_BYTES};
pub use handler::IpcHandler;
pub use protocol::{EscalationEventView, JobOutcome, Message};
pub use server::IpcServer;
