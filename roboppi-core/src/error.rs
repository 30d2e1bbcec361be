//! Error type for the wiring crate itself. Subsystem crates keep their own
//! closed error enums; this one covers config loading, job payload
//! shaping, and artifact I/O — the glue `roboppi-core` adds on top.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value at {path}: {message}")]
    ConfigValue { path: String, message: String },

    #[error("failed to read workflow file {path}: {source}")]
    WorkflowRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow file {path}: {source}")]
    WorkflowParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("workflow validation failed: {0}")]
    WorkflowInvalid(#[from] roboppi_common::error::CommonError),

    #[error("job payload invalid: {0}")]
    InvalidPayload(String),

    #[error("failed to write artifact {path}: {source}")]
    ArtifactWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
