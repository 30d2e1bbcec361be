//! Workflow/step definitions and runtime state (spec.md §3).

use crate::error::CommonError;
use crate::worker::{Capability, WorkerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Continue,
    Retry,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Abort
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnIterationsExhausted {
    Continue,
    Fail,
}

/// Action policy for a triggered stall watcher (spec.md §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallAction {
    Ignore,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOutputSource {
    WorkerEvent,
    AnyEvent,
    ProbeOnly,
}

impl Default for NoOutputSource {
    fn default() -> Self {
        NoOutputSource::WorkerEvent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorAction {
    Ignore,
    Stall,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallPolicy {
    #[serde(default, with = "humantime_serde::option")]
    pub no_output_timeout: Option<Duration>,
    #[serde(default)]
    pub no_output_source: NoOutputSource,
    pub probe_command: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub probe_interval: Option<Duration>,
    pub stall_threshold: Option<u32>,
    #[serde(default = "default_probe_error_action")]
    pub on_probe_error: ProbeErrorAction,
    pub probe_error_threshold: Option<u32>,
    #[serde(default = "default_stall_action")]
    pub action: StallAction,
}

fn default_probe_error_action() -> ProbeErrorAction {
    ProbeErrorAction::Ignore
}

fn default_stall_action() -> StallAction {
    StallAction::Interrupt
}

/// Same shape as a worker task, plus iteration controls (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionCheckSpec {
    pub worker: WorkerKind,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
    pub max_iterations: u32,
    #[serde(default = "default_on_iterations_exhausted")]
    pub on_iterations_exhausted: OnIterationsExhausted,
}

fn default_on_iterations_exhausted() -> OnIterationsExhausted {
    OnIterationsExhausted::Fail
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    pub from: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementHookOverride {
    pub hook_id: String,
    #[serde(default)]
    pub before: bool,
    #[serde(default)]
    pub after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub worker: WorkerKind,
    pub workspace: String,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub on_failure: OnFailure,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub inputs: HashMap<String, InputSource>,
    #[serde(default)]
    pub outputs: HashSet<String>,
    pub completion_check: Option<CompletionCheckSpec>,
    pub stall_policy: Option<StallPolicy>,
    pub management: Option<ManagementHookOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub concurrency: Option<usize>,
    pub context_dir: Option<String>,
    /// Applied to every step that doesn't set its own `management`
    /// override (supplemental management-hooks feature, spec.md §3/§6).
    #[serde(default)]
    pub default_management: Option<ManagementHookOverride>,
    pub steps: HashMap<String, StepSpec>,
}

impl WorkflowDefinition {
    /// Validate referential integrity, acyclicity (Kahn), unique output
    /// names, and completion-check iteration floor (spec.md §3's
    /// invariants). Returns the failing field path on error, per
    /// spec.md §9's "never guesses intent" rule.
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.steps.is_empty() {
            return Err(CommonError::Validation {
                path: "steps".into(),
                message: "workflow must declare at least one step".into(),
            });
        }

        let mut seen_outputs: HashSet<&str> = HashSet::new();
        for (step_id, step) in &self.steps {
            for dep in &step.depends_on {
                if !self.steps.contains_key(dep) {
                    return Err(CommonError::Validation {
                        path: format!("steps.{step_id}.depends_on"),
                        message: format!("unknown step id {dep:?}"),
                    });
                }
            }
            for (input_name, source) in &step.inputs {
                if !step.depends_on.contains(&source.from) {
                    return Err(CommonError::Validation {
                        path: format!("steps.{step_id}.inputs.{input_name}"),
                        message: format!(
                            "input source step {:?} is not in depends_on",
                            source.from
                        ),
                    });
                }
            }
            for output in &step.outputs {
                if !seen_outputs.insert(output.as_str()) {
                    return Err(CommonError::Validation {
                        path: format!("steps.{step_id}.outputs"),
                        message: format!("duplicate output name {output:?}"),
                    });
                }
            }
            if let Some(check) = &step.completion_check {
                if check.max_iterations < 2 {
                    return Err(CommonError::Validation {
                        path: format!("steps.{step_id}.completion_check.max_iterations"),
                        message: "max_iterations must be >= 2".into(),
                    });
                }
            }
            if is_unsafe_relative(&step.workspace) {
                return Err(CommonError::Validation {
                    path: format!("steps.{step_id}.workspace"),
                    message: format!("workspace path {:?} is not a safe relative path", step.workspace),
                });
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Kahn's algorithm: repeatedly remove nodes with in-degree 0. If any
    /// node remains when no more can be removed, the graph has a cycle.
    fn check_acyclic(&self) -> Result<(), CommonError> {
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|(id, step)| (id.as_str(), step.depends_on.len()))
            .collect();

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        // successors: step_id -> steps that depend on it
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, step) in &self.steps {
            for dep in &step.depends_on {
                successors.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        while let Some(node) = ready.pop() {
            visited += 1;
            if let Some(succs) = successors.get(node) {
                for succ in succs {
                    let deg = in_degree.get_mut(*succ).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(succ);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(CommonError::Validation {
                path: "steps".into(),
                message: "dependency graph contains a cycle".into(),
            });
        }
        Ok(())
    }
}

fn is_unsafe_relative(path: &str) -> bool {
    path.starts_with('/') || path.split('/').any(|segment| segment == "..")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Checking,
    Succeeded,
    Failed,
    Skipped,
    Incomplete,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRuntimeState {
    pub status: StepStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub outputs: HashMap<String, serde_json::Value>,
    pub attempts: u32,
}

impl Default for StepRuntimeState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            iteration: 0,
            max_iterations: 1,
            started_at: None,
            ended_at: None,
            last_error: None,
            outputs: HashMap::new(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRuntimeState {
    pub status: WorkflowStatus,
    pub steps: HashMap<String, StepRuntimeState>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRuntimeState {
    pub fn new(def: &WorkflowDefinition) -> Self {
        let steps = def
            .steps
            .iter()
            .map(|(id, spec)| {
                let max_iterations = spec
                    .completion_check
                    .as_ref()
                    .map(|c| c.max_iterations)
                    .unwrap_or(1);
                (
                    id.clone(),
                    StepRuntimeState {
                        max_iterations,
                        ..StepRuntimeState::default()
                    },
                )
            })
            .collect();
        Self {
            status: WorkflowStatus::Pending,
            steps,
            started_at: None,
            ended_at: None,
        }
    }
}
