//! Error type for the IPC crate.

use thiserror::Error;

pub type IpcResult<T> = Result<T, IpcError>;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("io error on IPC transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeded the 1 MiB frame limit")]
    LineTooLong,

    #[error("malformed IPC message: {0}")]
    Malformed(String),

    #[error("request {0} timed out waiting for a correlated response")]
    Timeout(String),
}
