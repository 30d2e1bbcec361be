//! Escalation manager: aggregates crash/cancel-timeout/thrashing signals
//! over a 60s sliding window, per worker kind and per workspace (spec.md
//! §4.14).

use parking_lot::Mutex;
use roboppi_common::WorkerKind;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Isolate,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    WorkerKind(String),
    Workspace(String),
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationEvent {
    pub scope: Scope,
    pub action: Action,
    pub severity: Severity,
}

#[derive(Default)]
struct Signals {
    crashes: Vec<Instant>,
    cancel_timeouts: Vec<Instant>,
    latest_wins: Vec<Instant>,
}

pub struct EscalationConfig {
    pub crash_threshold: usize,
    pub latest_wins_threshold: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            crash_threshold: 3,
            latest_wins_threshold: 3,
        }
    }
}

/// Sliding-window signal aggregator. Call `record_*` as signals happen;
/// each call returns the events it newly emits.
pub struct EscalationManager {
    config: EscalationConfig,
    by_worker_kind: Mutex<HashMap<String, Signals>>,
    by_workspace: Mutex<HashMap<String, Signals>>,
}

impl EscalationManager {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            by_worker_kind: Mutex::new(HashMap::new()),
            by_workspace: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_crash(&self, worker_kind: &WorkerKind) -> Vec<EscalationEvent> {
        let key = worker_kind.to_string();
        let mut by_kind = self.by_worker_kind.lock();
        let signals = by_kind.entry(key.clone()).or_default();
        prune(&mut signals.crashes);
        signals.crashes.push(Instant::now());

        let mut events = Vec::new();
        if signals.crashes.len() >= self.config.crash_threshold {
            events.push(EscalationEvent {
                scope: Scope::WorkerKind(key.clone()),
                action: Action::Isolate,
                severity: Severity::Error,
            });
        }
        drop(by_kind);
        if self.count_failing_kinds() >= 2 {
            events.push(EscalationEvent {
                scope: Scope::Global,
                action: Action::Stop,
                severity: Severity::Fatal,
            });
        }
        events
    }

    pub fn record_cancel_timeout(&self, worker_kind: &WorkerKind) -> Vec<EscalationEvent> {
        let key = worker_kind.to_string();
        let mut by_kind = self.by_worker_kind.lock();
        let signals = by_kind.entry(key.clone()).or_default();
        prune(&mut signals.cancel_timeouts);
        signals.cancel_timeouts.push(Instant::now());

        // Any positive count within the window emits a warning.
        vec![EscalationEvent {
            scope: Scope::WorkerKind(key),
            action: Action::Isolate,
            severity: Severity::Warning,
        }]
    }

    pub fn record_latest_wins_replacement(&self, workspace: &str) -> Vec<EscalationEvent> {
        let mut by_ws = self.by_workspace.lock();
        let signals = by_ws.entry(workspace.to_string()).or_default();
        prune(&mut signals.latest_wins);
        signals.latest_wins.push(Instant::now());

        if signals.latest_wins.len() >= self.config.latest_wins_threshold {
            vec![EscalationEvent {
                scope: Scope::Workspace(workspace.to_string()),
                action: Action::Stop,
                severity: Severity::Error,
            }]
        } else {
            Vec::new()
        }
    }

    fn count_failing_kinds(&self) -> usize {
        let by_kind = self.by_worker_kind.lock();
        by_kind
            .values()
            .filter(|s| {
                let mut crashes = s.crashes.clone();
                prune(&mut crashes);
                !crashes.is_empty()
            })
            .count()
    }
}

fn prune(timestamps: &mut Vec<Instant>) {
    let cutoff = Instant::now() - WINDOW;
    timestamps.retain(|ts| *ts >= cutoff);
}
