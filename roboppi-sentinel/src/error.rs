//! Error type for the stall sentinel crate.

use thiserror::Error;

pub type SentinelResult<T> = Result<T, SentinelError>;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("failed to write stall artifact at {path}: {source}")]
    ArtifactWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe command failed to spawn: {0}")]
    ProbeSpawn(String),
}
