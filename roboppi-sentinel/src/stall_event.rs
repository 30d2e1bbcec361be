//! The `roboppi.sentinel.stall.v1` artifact (spec.md §4.12, §6): written
//! exactly once per trigger under the `interrupt` action, atomically
//! replaced so a concurrent reader never observes a half-written file.

use crate::error::{SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallEvent {
    pub schema: String,
    pub step_id: String,
    pub triggered_at: DateTime<Utc>,
    pub action: String,
    /// Short machine-checkable tags, e.g. `stall/no-output`,
    /// `stall/no-initial-output`, `stall/no-progress`.
    pub fingerprints: Vec<String>,
    pub reasons: Vec<String>,
}

impl StallEvent {
    pub fn new(step_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            schema: "roboppi.sentinel.stall.v1".to_string(),
            step_id: step_id.into(),
            triggered_at: Utc::now(),
            action: action.into(),
            fingerprints: Vec::new(),
            reasons: Vec::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprints.push(fingerprint.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Writes `<dir>/_stall/event.json` via write-to-temp-then-rename.
    pub async fn write_to(&self, step_dir: &Path) -> SentinelResult<()> {
        let stall_dir = step_dir.join("_stall");
        tokio::fs::create_dir_all(&stall_dir)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: stall_dir.display().to_string(),
                source,
            })?;

        let final_path = stall_dir.join("event.json");
        let tmp_path = stall_dir.join("event.json.tmp");
        let body = serde_json::to_vec_pretty(self).expect("StallEvent always serializes");

        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: tmp_path.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: final_path.display().to_string(),
                source,
            })?;
        Ok(())
    }
}

/// One line of `_stall/probe.jsonl`: the raw classification from a single
/// no-progress probe invocation, appended for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub observed_at: DateTime<Utc>,
    pub class: String,
    pub digest: u64,
    pub consecutive_count: u32,
}

impl ProbeRecord {
    /// Appends a single JSON line to `<dir>/_stall/probe.jsonl`.
    pub async fn append_to(&self, step_dir: &Path) -> SentinelResult<()> {
        use tokio::io::AsyncWriteExt;

        let stall_dir = step_dir.join("_stall");
        tokio::fs::create_dir_all(&stall_dir)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: stall_dir.display().to_string(),
                source,
            })?;

        let path = stall_dir.join("probe.jsonl");
        let mut line = serde_json::to_vec(self).expect("ProbeRecord always serializes");
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(&line)
            .await
            .map_err(|source| SentinelError::ArtifactWrite {
                path: path.display().to_string(),
                source,
            })?;
        Ok(())
    }
}
