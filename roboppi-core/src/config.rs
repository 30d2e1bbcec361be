//! Ambient configuration (spec.md §6's env var list; SPEC_FULL.md's
//! ambient-stack expansion). Loaded `defaults -> TOML file -> ROBOPPI_*
//! env vars`, each layer overriding only the fields it sets, matching the
//! teacher's `knhk-sidecar::config::SidecarConfig` file-then-env shape
//! (generalized here to also read the env layer, since spec.md names a
//! single documented env prefix as an external interface).

use crate::error::{CoreError, CoreResult};
use roboppi_admission::backpressure::BackpressureThresholds;
use roboppi_admission::budget::BudgetLimits;
use roboppi_executor::EscalationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    pub max_concurrency: u32,
    pub max_rps: u32,
    pub max_cost_budget: Option<f64>,
}

impl From<&BudgetSection> for BudgetLimits {
    fn from(s: &BudgetSection) -> Self {
        BudgetLimits {
            max_concurrency: s.max_concurrency,
            max_rps: s.max_rps,
            max_cost_budget: s.max_cost_budget,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureSection {
    pub degrade: f64,
    pub defer: f64,
    pub reject: f64,
}

impl From<&BackpressureSection> for BackpressureThresholds {
    fn from(s: &BackpressureSection) -> Self {
        BackpressureThresholds {
            degrade: s.degrade,
            defer: s.defer,
            reject: s.reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSection {
    pub crash_threshold: usize,
    pub latest_wins_threshold: usize,
}

impl From<&EscalationSection> for EscalationConfig {
    fn from(s: &EscalationSection) -> Self {
        EscalationConfig {
            crash_threshold: s.crash_threshold,
            latest_wins_threshold: s.latest_wins_threshold,
        }
    }
}

/// Supervisor-level tunables (spec.md §6 environment variable list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoboppiConfig {
    pub transport: Transport,
    pub socket_path: Option<String>,
    pub verbose: bool,
    /// Bounds recursive sub-workflow invocation depth. Named in spec.md's
    /// external env var list; no [MODULE] in spec.md defines a
    /// sub-workflow execution operation, so this is carried as validated
    /// configuration without a consumer yet.
    pub max_subworkflow_depth: u32,
    pub budget: BudgetSection,
    pub backpressure: BackpressureSection,
    pub breaker: BreakerSection,
    pub escalation: EscalationSection,
    /// External command registered per management hook id (supplemental
    /// feature, spec.md §3/§6). Empty by default — a workflow referencing
    /// an unregistered hook id degrades to `{action: proceed}` the same
    /// way a failing hook command does.
    #[serde(default)]
    pub hooks: HashMap<String, String>,
    /// Interval at which `MetricsSnapshot` is logged (spec.md's ambient
    /// metrics surface).
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for RoboppiConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            socket_path: None,
            verbose: false,
            max_subworkflow_depth: 8,
            budget: BudgetSection {
                max_concurrency: 8,
                max_rps: 16,
                max_cost_budget: None,
            },
            backpressure: BackpressureSection {
                degrade: 0.5,
                defer: 0.75,
                reject: 0.9,
            },
            breaker: BreakerSection {
                failure_threshold: 3,
                open_duration: Duration::from_secs(30),
            },
            escalation: EscalationSection {
                crash_threshold: 3,
                latest_wins_threshold: 3,
            },
            hooks: HashMap::new(),
            metrics_interval: default_metrics_interval(),
        }
    }
}

impl RoboppiConfig {
    /// Load from an optional TOML file, then apply `ROBOPPI_`-prefixed
    /// env var overrides, in that ascending order of precedence.
    pub fn load(file_path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match file_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigRead {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| CoreError::ConfigParse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Single documented env prefix (spec.md §6): transport selection,
    /// verbose logging toggle, max subworkflow nesting depth. Unset vars
    /// leave the file/default value untouched; malformed values are
    /// ignored rather than rejected, matching the teacher's
    /// `unwrap_or_else` fallback style in `main.rs`.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ROBOPPI_TRANSPORT") {
            match val.as_str() {
                "stdio" => self.transport = Transport::Stdio,
                "socket" => self.transport = Transport::Socket,
                other => tracing::warn!(value = other, "ignoring unrecognized ROBOPPI_TRANSPORT"),
            }
        }
        if let Ok(val) = std::env::var("ROBOPPI_SOCKET_PATH") {
            self.socket_path = Some(val);
        }
        if let Ok(val) = std::env::var("ROBOPPI_VERBOSE") {
            if let Ok(parsed) = val.parse::<bool>() {
                self.verbose = parsed;
            }
        }
        if let Ok(val) = std::env::var("ROBOPPI_MAX_SUBWORKFLOW_DEPTH") {
            if let Ok(parsed) = val.parse::<u32>() {
                self.max_subworkflow_depth = parsed;
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.transport == Transport::Socket && self.socket_path.is_none() {
            return Err(CoreError::ConfigValue {
                path: "socket_path".to_string(),
                message: "transport = socket requires socket_path".to_string(),
            });
        }
        if self.max_subworkflow_depth == 0 {
            return Err(CoreError::ConfigValue {
                path: "max_subworkflow_depth".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        BackpressureThresholds::from(&self.backpressure)
            .validate()
            .map_err(|e| CoreError::ConfigValue {
                path: "backpressure".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}
