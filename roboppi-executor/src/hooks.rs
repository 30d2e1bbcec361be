//! Management hooks (supplemental feature; spec.md §3 "management-hook
//! overrides" and §6's `_management/` artifact paths, never otherwise
//! defined in spec.md's [MODULE] sections). A per-step, per-phase
//! callout: before and after a step runs, if a hook id is configured
//! (step override or workflow default), the executor writes an input
//! file, runs the configured external command, reads back a decision,
//! and appends to an audit log. Any parse/shape failure degrades to
//! `{action: proceed}` plus an audit-log entry, matching spec.md §7's
//! management-directive-validation-failure rule.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Proceed,
    Retry,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Before,
    After,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HookInput<'a> {
    pub step_id: &'a str,
    pub phase: &'static str,
    pub worker_kind: String,
    pub instructions: &'a str,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub attempt_index: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct HookDecisionFile {
    action: HookAction,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct DecisionLogLine<'a> {
    hook_id: &'a str,
    step_id: &'a str,
    phase: &'static str,
    recorded_at: chrono::DateTime<Utc>,
    action: HookAction,
    detail: Option<String>,
    degraded: bool,
}

/// Runs one hook invocation for `hook_id` against `step_dir/_management`,
/// returning the resulting action. Never returns an error: any failure
/// (spawn failure, non-zero exit, missing/malformed decision file)
/// degrades to `Proceed` after logging, per spec.md §7.
pub async fn run_hook(
    step_dir: &Path,
    hook_id: &str,
    command: &str,
    phase: HookPhase,
    input: &HookInput<'_>,
) -> HookAction {
    let hook_dir = step_dir.join("_management").join("inv").join(hook_id);
    if let Err(e) = tokio::fs::create_dir_all(&hook_dir).await {
        warn!(hook_id, error = %e, "failed to create management hook directory, degrading to proceed");
        return degrade(step_dir, hook_id, phase, None, "directory-create-failed").await;
    }

    let input_path = hook_dir.join("input.json");
    let input_body = match serde_json::to_vec_pretty(input) {
        Ok(body) => body,
        Err(e) => {
            warn!(hook_id, error = %e, "failed to serialize hook input, degrading to proceed");
            return degrade(step_dir, hook_id, phase, None, "input-serialize-failed").await;
        }
    };
    if let Err(e) = tokio::fs::write(&input_path, &input_body).await {
        warn!(hook_id, error = %e, "failed to write hook input.json, degrading to proceed");
        return degrade(step_dir, hook_id, phase, None, "input-write-failed").await;
    }

    let decision_path = hook_dir.join("decision.json");
    let _ = tokio::fs::remove_file(&decision_path).await;

    let spawn_result = Command::new("sh")
        .arg("-c")
        .arg(command)
        .arg("--")
        .arg(&input_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match spawn_result {
        Ok(output) => output,
        Err(e) => {
            warn!(hook_id, error = %e, "management hook command failed to spawn, degrading to proceed");
            return degrade(step_dir, hook_id, phase, None, "spawn-failed").await;
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(hook_id, code = ?output.status.code(), stderr = %stderr, "management hook exited non-zero, degrading to proceed");
        return degrade(step_dir, hook_id, phase, None, "nonzero-exit").await;
    }

    let raw = match tokio::fs::read(&decision_path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(hook_id, error = %e, "management hook wrote no decision.json, degrading to proceed");
            return degrade(step_dir, hook_id, phase, None, "decision-missing").await;
        }
    };
    let decision: HookDecisionFile = match serde_json::from_slice(&raw) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(hook_id, error = %e, "management hook decision.json malformed, degrading to proceed");
            return degrade(step_dir, hook_id, phase, None, "decision-malformed").await;
        }
    };

    append_decision(step_dir, hook_id, input.step_id, phase, decision.action, decision.detail, false).await;
    decision.action
}

async fn degrade(
    step_dir: &Path,
    hook_id: &str,
    phase: HookPhase,
    detail: Option<String>,
    reason: &str,
) -> HookAction {
    append_decision(
        step_dir,
        hook_id,
        "",
        phase,
        HookAction::Proceed,
        detail.or_else(|| Some(reason.to_string())),
        true,
    )
    .await;
    HookAction::Proceed
}

async fn append_decision(
    step_dir: &Path,
    hook_id: &str,
    step_id: &str,
    phase: HookPhase,
    action: HookAction,
    detail: Option<String>,
    degraded: bool,
) {
    use tokio::io::AsyncWriteExt;

    let management_dir = step_dir.join("_management");
    if let Err(e) = tokio::fs::create_dir_all(&management_dir).await {
        warn!(error = %e, "failed to create _management directory for decision log");
        return;
    }
    let line = DecisionLogLine {
        hook_id,
        step_id,
        phase: phase.as_str(),
        recorded_at: Utc::now(),
        action,
        detail,
        degraded,
    };
    let mut body = match serde_json::to_vec(&line) {
        Ok(body) => body,
        Err(_) => return,
    };
    body.push(b'\n');

    let path = management_dir.join("decisions.jsonl");
    match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(mut file) => {
            let _ = file.write_all(&body).await;
        }
        Err(e) => warn!(error = %e, "failed to append to decisions.jsonl"),
    }
}

/// Resolves which hook id (if any) applies to `step` for a given phase,
/// combining the step's own override with the workflow default.
pub fn resolve_hook_id(
    step_override: &Option<roboppi_common::ManagementHookOverride>,
    workflow_default: &Option<roboppi_common::ManagementHookOverride>,
    phase: HookPhase,
) -> Option<String> {
    let pick = |o: &roboppi_common::ManagementHookOverride| -> bool {
        match phase {
            HookPhase::Before => o.before,
            HookPhase::After => o.after,
        }
    };
    if let Some(o) = step_override {
        if pick(o) {
            return Some(o.hook_id.clone());
        }
    }
    if let Some(o) = workflow_default {
        if pick(o) {
            return Some(o.hook_id.clone());
        }
    }
    None
}

/// Registry mapping a hook id to the external command that implements
/// it, loaded from `RoboppiConfig` (roboppi-core's ambient config).
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    commands: std::collections::HashMap<String, String>,
}

impl HookRegistry {
    pub fn new(commands: std::collections::HashMap<String, String>) -> Self {
        Self { commands }
    }

    pub fn command_for(&self, hook_id: &str) -> Option<&str> {
        self.commands.get(hook_id).map(String::as_str)
    }
}

pub fn hook_artifact_dir(step_dir: &Path) -> PathBuf {
    step_dir.join("_management")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(step_id: &'a str, phase: &'static str) -> HookInput<'a> {
        HookInput {
            step_id,
            phase,
            worker_kind: "codex_cli".to_string(),
            instructions: "do work",
            trace_id: None,
            correlation_id: None,
            attempt_index: 0,
        }
    }

    #[tokio::test]
    async fn hook_command_that_writes_proceed_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"path="$1"; dir=$(dirname "$path"); echo '{"action":"proceed"}' > "$dir/decision.json""#;
        let action = run_hook(dir.path(), "h1", script, HookPhase::Before, &input("build", "before")).await;
        assert_eq!(action, HookAction::Proceed);

        let log = tokio::fs::read_to_string(dir.path().join("_management/decisions.jsonl"))
            .await
            .unwrap();
        assert!(log.contains("\"hook_id\":\"h1\""));
    }

    #[tokio::test]
    async fn hook_command_that_writes_abort_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"path="$1"; dir=$(dirname "$path"); echo '{"action":"abort","detail":"nope"}' > "$dir/decision.json""#;
        let action = run_hook(dir.path(), "h1", script, HookPhase::After, &input("build", "after")).await;
        assert_eq!(action, HookAction::Abort);
    }

    #[tokio::test]
    async fn missing_decision_file_degrades_to_proceed() {
        let dir = tempfile::tempdir().unwrap();
        let action = run_hook(dir.path(), "h1", "true", HookPhase::Before, &input("build", "before")).await;
        assert_eq!(action, HookAction::Proceed);
        let log = tokio::fs::read_to_string(dir.path().join("_management/decisions.jsonl"))
            .await
            .unwrap();
        assert!(log.contains("\"degraded\":true"));
    }

    #[tokio::test]
    async fn failing_command_degrades_to_proceed() {
        let dir = tempfile::tempdir().unwrap();
        let action = run_hook(dir.path(), "h1", "exit 1", HookPhase::Before, &input("build", "before")).await;
        assert_eq!(action, HookAction::Proceed);
    }

    #[test]
    fn resolve_hook_id_prefers_step_override_over_workflow_default() {
        let step_override = Some(roboppi_common::ManagementHookOverride {
            hook_id: "step-hook".to_string(),
            before: true,
            after: false,
        });
        let workflow_default = Some(roboppi_common::ManagementHookOverride {
            hook_id: "default-hook".to_string(),
            before: true,
            after: true,
        });
        assert_eq!(
            resolve_hook_id(&step_override, &workflow_default, HookPhase::Before),
            Some("step-hook".to_string())
        );
        // Step override doesn't enable `after`, so it falls through to the
        // workflow default for that phase.
        assert_eq!(
            resolve_hook_id(&step_override, &workflow_default, HookPhase::After),
            Some("default-hook".to_string())
        );
    }

    #[test]
    fn no_override_and_no_default_resolves_to_none() {
        assert_eq!(resolve_hook_id(&None, &None, HookPhase::Before), None);
    }
}
