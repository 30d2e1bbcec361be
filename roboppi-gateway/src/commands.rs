//! Argument construction from `task.capabilities` (spec.md §4.6). Each
//! worker kind maps the same capability set onto its own CLI's flags; a
//! bare task with no capabilities is run read-only.

use roboppi_common::{Capability, WorkerTask};

fn capability_flags(task: &WorkerTask) -> Vec<String> {
    let mut flags = Vec::new();
    if task.capabilities.contains(&Capability::Edit) {
        flags.push("--allow-edit".to_string());
    }
    if task.capabilities.contains(&Capability::RunTests) {
        flags.push("--allow-run-tests".to_string());
    }
    if task.capabilities.contains(&Capability::RunCommands) {
        flags.push("--allow-run-commands".to_string());
    }
    if flags.is_empty() {
        flags.push("--read-only".to_string());
    }
    flags
}

pub fn codex_cli_command(task: &WorkerTask) -> (String, Vec<String>) {
    let mut args = vec!["exec".to_string(), "--cd".to_string(), task.workspace.display().to_string()];
    args.extend(capability_flags(task));
    args.push(task.instructions.clone());
    ("codex".to_string(), args)
}

pub fn claude_code_command(task: &WorkerTask) -> (String, Vec<String>) {
    let mut args = vec!["--cwd".to_string(), task.workspace.display().to_string()];
    args.extend(capability_flags(task));
    args.push("-p".to_string());
    args.push(task.instructions.clone());
    ("claude".to_string(), args)
}

pub fn opencode_command(task: &WorkerTask) -> (String, Vec<String>) {
    let mut args = vec!["run".to_string(), "--cwd".to_string(), task.workspace.display().to_string()];
    args.extend(capability_flags(task));
    args.push(task.instructions.clone());
    ("opencode".to_string(), args)
}

/// Builds the command closure for an operator-registered custom worker
/// kind (spec.md §6: `worker_kind: custom` names an arbitrary external
/// command).
pub fn custom_command(name: String) -> impl Fn(&WorkerTask) -> (String, Vec<String>) + Send + Sync + 'static {
    move |task: &WorkerTask| {
        let mut args = vec!["--cwd".to_string(), task.workspace.display().to_string()];
        args.extend(capability_flags(task));
        args.push(task.instructions.clone());
        (name.clone(), args)
    }
}

/// Builds the command for a maintenance job (SPEC_FULL.md's plugin
/// event/maintenance supplemental feature): the task's instructions
/// field carries the shell command text to run to completion.
pub fn maintenance_command(task: &WorkerTask) -> (String, Vec<String>) {
    ("sh".to_string(), vec!["-c".to_string(), task.instructions.clone()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_common::{OutputMode, WorkerBudget, WorkerHandleId, WorkerKind};
    use roboppi_common::cancellation::CancelHandle;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    fn task(capabilities: HashSet<Capability>) -> WorkerTask {
        WorkerTask {
            task_id: WorkerHandleId::new(),
            worker_kind: WorkerKind::CodexCli,
            workspace: PathBuf::from("/work"),
            instructions: "fix the bug".to_string(),
            capabilities,
            output_mode: OutputMode::Batch,
            budget: WorkerBudget {
                deadline: Duration::from_secs(60),
                max_steps: None,
                max_command_time: None,
                grace_period: None,
            },
            abort: CancelHandle::new(),
            activity: None,
        }
    }

    #[test]
    fn empty_capabilities_are_read_only() {
        let (_cmd, args) = codex_cli_command(&task(HashSet::new()));
        assert!(args.contains(&"--read-only".to_string()));
    }

    #[test]
    fn edit_and_run_tests_map_to_flags() {
        let caps = HashSet::from([Capability::Edit, Capability::RunTests]);
        let (_cmd, args) = claude_code_command(&task(caps));
        assert!(args.contains(&"--allow-edit".to_string()));
        assert!(args.contains(&"--allow-run-tests".to_string()));
        assert!(!args.contains(&"--read-only".to_string()));
    }

    #[test]
    fn instructions_are_the_final_argument() {
        let (_cmd, args) = opencode_command(&task(HashSet::new()));
        assert_eq!(args.last(), Some(&"fix the bug".to_string()));
    }

    #[test]
    fn custom_command_uses_the_registered_name() {
        let builder = custom_command("my-agent".to_string());
        let (cmd, _args) = builder(&task(HashSet::new()));
        assert_eq!(cmd, "my-agent");
    }
}
