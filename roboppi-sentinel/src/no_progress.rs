//! No-progress watcher (spec.md §4.12): runs a shell probe command on an
//! interval, classifies its structured output, and triggers once a
//! stable digest repeats `stall_threshold` times in a row (or the probe
//! reports `terminal`, which triggers immediately).

use crate::error::SentinelError;
use crate::stall_event::{ProbeRecord, StallEvent};
use roboppi_common::cancellation::{CancelHandle, CancelReason};
use roboppi_common::workflow::{ProbeErrorAction, StallAction};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeClass {
    Progressing,
    Stalled,
    Terminal,
}

impl ProbeClass {
    /// Parses the probe's first non-empty output line. Anything not
    /// recognized is treated as `progressing` — a probe that doesn't
    /// speak the protocol should never itself cause a false stall.
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stalled" => ProbeClass::Stalled,
            "terminal" => ProbeClass::Terminal,
            _ => ProbeClass::Progressing,
        }
    }
}

pub struct NoProgressWatcherConfig {
    pub step_id: String,
    pub step_dir: PathBuf,
    pub probe_command: String,
    pub probe_interval: Duration,
    pub stall_threshold: u32,
    pub on_probe_error: ProbeErrorAction,
    pub probe_error_threshold: Option<u32>,
    pub action: StallAction,
}

fn digest_of(summary: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    summary.hash(&mut hasher);
    hasher.finish()
}

async fn run_probe_once(command: &str) -> Result<(ProbeClass, String), SentinelError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SentinelError::ProbeSpawn(e.to_string()))?;

    if !output.status.success() {
        return Err(SentinelError::ProbeSpawn(format!(
            "probe exited with {:?}",
            output.status.code()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let class = ProbeClass::parse(stdout.lines().next().unwrap_or(""));
    Ok((class, stdout))
}

pub async fn run(config: NoProgressWatcherConfig, handle: CancelHandle) {
    let mut ticker = tokio::time::interval(config.probe_interval);
    ticker.tick().await;

    let mut last_digest: Option<u64> = None;
    let mut consecutive = 0u32;
    let mut probe_errors = 0u32;

    loop {
        ticker.tick().await;
        if handle.is_aborted() {
            return;
        }

        match run_probe_once(&config.probe_command).await {
            Ok((class, summary)) => {
                probe_errors = 0;
                let digest = digest_of(&summary);

                if class == ProbeClass::Terminal {
                    let record = ProbeRecord {
                        observed_at: chrono::Utc::now(),
                        class: "terminal".to_string(),
                        digest,
                        consecutive_count: consecutive + 1,
                    };
                    let _ = record.append_to(&config.step_dir).await;
                    trigger(&config, &handle, "stall/no-progress-terminal", "probe reported terminal".to_string()).await;
                    return;
                }

                if Some(digest) == last_digest && class == ProbeClass::Stalled {
                    consecutive += 1;
                } else {
                    consecutive = if class == ProbeClass::Stalled { 1 } else { 0 };
                }
                last_digest = Some(digest);

                let record = ProbeRecord {
                    observed_at: chrono::Utc::now(),
                    class: match class {
                        ProbeClass::Progressing => "progressing",
                        ProbeClass::Stalled => "stalled",
                        ProbeClass::Terminal => "terminal",
                    }
                    .to_string(),
                    digest,
                    consecutive_count: consecutive,
                };
                let _ = record.append_to(&config.step_dir).await;

                if consecutive >= config.stall_threshold {
                    let reason = format!(
                        "probe digest unchanged for {} consecutive checks (threshold {})",
                        consecutive, config.stall_threshold
                    );
                    trigger(&config, &handle, "stall/no-progress", reason).await;
                    return;
                }
            }
            Err(err) => {
                probe_errors += 1;
                warn!(step_id = %config.step_id, error = %err, "no-progress probe failed");
                let threshold_reached = config
                    .probe_error_threshold
                    .map(|t| probe_errors >= t)
                    .unwrap_or(true);
                if !threshold_reached {
                    continue;
                }
                match config.on_probe_error {
                    ProbeErrorAction::Ignore => continue,
                    ProbeErrorAction::Stall => {
                        trigger(&config, &handle, "stall/probe-error", format!("probe failed: {err}")).await;
                        return;
                    }
                    ProbeErrorAction::Terminal => {
                        trigger(&config, &handle, "stall/probe-error-terminal", format!("probe failed: {err}")).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn trigger(config: &NoProgressWatcherConfig, handle: &CancelHandle, fingerprint: &str, reason: String) {
    match config.action {
        StallAction::Ignore => {
            warn!(step_id = %config.step_id, fingerprint = %fingerprint, "{reason}");
        }
        StallAction::Interrupt => {
            info!(step_id = %config.step_id, fingerprint = %fingerprint, "stall sentinel interrupting step");
            let event = StallEvent::new(config.step_id.clone(), "interrupt")
                .with_fingerprint(fingerprint.to_string())
                .with_reason(reason);
            if let Err(err) = event.write_to(&config.step_dir).await {
                warn!(step_id = %config.step_id, error = %err, "failed to write stall event artifact");
            }
            handle.fire(CancelReason::Sentinel(fingerprint.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_known_classes() {
        assert_eq!(ProbeClass::parse("stalled"), ProbeClass::Stalled);
        assert_eq!(ProbeClass::parse("TERMINAL\n"), ProbeClass::Terminal);
        assert_eq!(ProbeClass::parse("progressing"), ProbeClass::Progressing);
        assert_eq!(ProbeClass::parse("garbage"), ProbeClass::Progressing);
    }

    #[test]
    fn digest_is_stable_for_equal_input() {
        assert_eq!(digest_of("same"), digest_of("same"));
        assert_ne!(digest_of("same"), digest_of("different"));
    }

    #[tokio::test]
    async fn terminal_probe_triggers_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let handle = CancelHandle::new();
        let config = NoProgressWatcherConfig {
            step_id: "build".to_string(),
            step_dir: dir.path().to_path_buf(),
            probe_command: "echo terminal".to_string(),
            probe_interval: Duration::from_millis(10),
            stall_threshold: 3,
            on_probe_error: ProbeErrorAction::Ignore,
            probe_error_threshold: None,
            action: StallAction::Interrupt,
        };
        run(config, handle.clone()).await;
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn progressing_probe_never_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let handle = CancelHandle::new();
        let config = NoProgressWatcherConfig {
            step_id: "build".to_string(),
            step_dir: dir.path().to_path_buf(),
            probe_command: "echo progressing".to_string(),
            probe_interval: Duration::from_millis(5),
            stall_threshold: 3,
            on_probe_error: ProbeErrorAction::Ignore,
            probe_error_threshold: None,
            action: StallAction::Interrupt,
        };
        let watch = tokio::spawn(run(config, handle.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_aborted());
        watch.abort();
    }
}
