//! Composes the no-output and no-progress watchers per step (spec.md
//! §4.12) behind one entry point: `StallSentinel::watch`. Both watchers
//! share the step's `CancelHandle`, so whichever fires first wins —
//! `CancelHandle::fire` is idempotent, and each watcher exits its loop on
//! its next tick once it observes the handle aborted, which gives the
//! "stop the watcher" half of the interrupt action without extra
//! bookkeeping.

use crate::activity::ActivityTracker;
use crate::no_output::{self, NoOutputWatcherConfig};
use crate::no_progress::{self, NoProgressWatcherConfig};
use roboppi_common::cancellation::CancelHandle;
use roboppi_common::workflow::StallPolicy;
use roboppi_common::ActivitySink;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running watch for one step. Dropping it stops both watchers; call
/// `stop` explicitly once the step settles so the spawned tasks don't
/// outlive it waiting on a handle nobody will ever fire.
pub struct StallWatch {
    tracker: Arc<ActivityTracker>,
    tasks: Vec<JoinHandle<()>>,
}

impl StallWatch {
    /// An `ActivitySink` that marks worker output on the tracker this
    /// watch is reading from. Hand this to the gateway via
    /// `WorkerTask::activity` before delegating.
    pub fn activity_sink(&self) -> ActivitySink {
        let tracker = Arc::clone(&self.tracker);
        ActivitySink::new(move || tracker.mark_worker_output())
    }

    pub fn mark_phase_transition(&self) {
        self.tracker.mark_phase_transition();
    }

    pub fn mark_state_update(&self) {
        self.tracker.mark_state_update();
    }

    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct StallSentinel;

impl StallSentinel {
    /// Spawns whichever watchers `policy` configures for `step_id`,
    /// sharing `handle` so a trigger aborts the step the same way a user
    /// cancel or deadline would.
    pub fn watch(step_id: impl Into<String>, step_dir: PathBuf, policy: &StallPolicy, handle: CancelHandle) -> StallWatch {
        let step_id = step_id.into();
        let tracker = Arc::new(ActivityTracker::new());
        let mut tasks = Vec::new();

        if let Some(timeout) = policy.no_output_timeout {
            let config = NoOutputWatcherConfig {
                step_id: step_id.clone(),
                step_dir: step_dir.clone(),
                timeout,
                source: policy.no_output_source,
                action: policy.action,
            };
            let tracker = Arc::clone(&tracker);
            let handle = handle.clone();
            tasks.push(tokio::spawn(no_output::run(config, tracker, handle)));
        }

        if let (Some(probe_command), Some(stall_threshold)) =
            (policy.probe_command.clone(), policy.stall_threshold)
        {
            let config = NoProgressWatcherConfig {
                step_id: step_id.clone(),
                step_dir: step_dir.clone(),
                probe_command,
                probe_interval: policy.probe_interval.unwrap_or(std::time::Duration::from_secs(30)),
                stall_threshold,
                on_probe_error: policy.on_probe_error,
                probe_error_threshold: policy.probe_error_threshold,
                action: policy.action,
            };
            let handle = handle.clone();
            tasks.push(tokio::spawn(no_progress::run(config, handle)));
        }

        StallWatch { tracker, tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roboppi_common::cancellation::CancelReason;
    use roboppi_common::workflow::{NoOutputSource, ProbeErrorAction, StallAction};
    use std::time::Duration;

    fn policy(no_output_timeout: Option<Duration>) -> StallPolicy {
        StallPolicy {
            no_output_timeout,
            no_output_source: NoOutputSource::WorkerEvent,
            probe_command: None,
            probe_interval: None,
            stall_threshold: None,
            on_probe_error: ProbeErrorAction::Ignore,
            probe_error_threshold: None,
            action: StallAction::Interrupt,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watch_installs_no_output_watcher_and_fires_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = CancelHandle::new();
        let watch = StallSentinel::watch(
            "build",
            dir.path().to_path_buf(),
            &policy(Some(Duration::from_millis(200))),
            handle.clone(),
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert!(handle.is_aborted());
        assert!(matches!(handle.reason(), Some(CancelReason::Sentinel(_))));
        watch.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_sink_pings_reset_the_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let handle = CancelHandle::new();
        let watch = StallSentinel::watch(
            "build",
            dir.path().to_path_buf(),
            &policy(Some(Duration::from_secs(5))),
            handle.clone(),
        );
        let sink = watch.activity_sink();

        tokio::time::advance(Duration::from_secs(2)).await;
        sink.ping();
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert!(!handle.is_aborted());
        watch.stop();
    }

    #[test]
    fn no_policy_fields_set_installs_no_watchers() {
        let dir = std::env::temp_dir();
        let handle = CancelHandle::new();
        let watch = StallSentinel::watch("build", dir, &policy(None), handle);
        assert!(watch.tasks.is_empty());
    }
}
