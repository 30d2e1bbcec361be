//! No-output watcher (spec.md §4.12): polls an `ActivityTracker` at
//! `min(1s, timeout/2)` and fires the step's cancellation handle once
//! `elapsed >= no_output_timeout`.

use crate::activity::ActivityTracker;
use crate::stall_event::StallEvent;
use roboppi_common::cancellation::{CancelHandle, CancelReason};
use roboppi_common::workflow::{NoOutputSource, StallAction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct NoOutputWatcherConfig {
    pub step_id: String,
    pub step_dir: PathBuf,
    pub timeout: Duration,
    pub source: NoOutputSource,
    pub action: StallAction,
}

fn check_interval(timeout: Duration) -> Duration {
    std::cmp::min(Duration::from_secs(1), timeout / 2)
}

/// Runs until the handle is aborted (by this watcher or anything else) or
/// the owning watch task is dropped. Safe to spawn on `tokio::spawn`.
pub async fn run(
    config: NoOutputWatcherConfig,
    tracker: Arc<ActivityTracker>,
    handle: CancelHandle,
) {
    let interval = check_interval(config.timeout);
    let mut ticker = tokio::time::interval(interval);
    // We only need checks once a tick actually elapses, not an immediate
    // first fire at t=0.
    ticker.tick().await;

    let mut already_warned = false;

    loop {
        ticker.tick().await;
        if handle.is_aborted() {
            return;
        }

        let reference = tracker.reference(config.source);
        let elapsed = reference.elapsed();
        if elapsed < config.timeout {
            continue;
        }

        let mut fingerprint = "stall/no-output".to_string();
        if !tracker.has_observed_worker_output() {
            fingerprint = "stall/no-initial-output".to_string();
        }

        let reason = format!(
            "no activity observed for {:?} (source={:?}, timeout={:?})",
            elapsed, config.source, config.timeout
        );

        match config.action {
            StallAction::Ignore => {
                if !already_warned {
                    warn!(step_id = %config.step_id, fingerprint = %fingerprint, "{reason}");
                    already_warned = true;
                }
            }
            StallAction::Interrupt => {
                info!(step_id = %config.step_id, fingerprint = %fingerprint, "stall sentinel interrupting step");
                let event = StallEvent::new(config.step_id.clone(), "interrupt")
                    .with_fingerprint(fingerprint.clone())
                    .with_reason(reason);
                if let Err(err) = event.write_to(&config.step_dir).await {
                    warn!(step_id = %config.step_id, error = %err, "failed to write stall event artifact");
                }
                handle.fire(CancelReason::Sentinel(fingerprint));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityTracker;

    #[test]
    fn check_interval_never_exceeds_one_second() {
        assert_eq!(check_interval(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(check_interval(Duration::from_millis(400)), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_fires_handle_after_timeout_elapses() {
        let tracker = Arc::new(ActivityTracker::new());
        let handle = CancelHandle::new();
        let dir = tempfile::tempdir().unwrap();

        let config = NoOutputWatcherConfig {
            step_id: "build".to_string(),
            step_dir: dir.path().to_path_buf(),
            timeout: Duration::from_millis(500),
            source: NoOutputSource::WorkerEvent,
            action: StallAction::Interrupt,
        };

        let watcher_handle = handle.clone();
        let watch = tokio::spawn(run(config, tracker, watcher_handle));

        tokio::time::advance(Duration::from_secs(2)).await;
        watch.await.unwrap();

        assert!(handle.is_aborted());
        assert!(matches!(handle.reason(), Some(CancelReason::Sentinel(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_activity_prevents_trigger() {
        let tracker = Arc::new(ActivityTracker::new());
        let handle = CancelHandle::new();
        let dir = tempfile::tempdir().unwrap();

        let config = NoOutputWatcherConfig {
            step_id: "build".to_string(),
            step_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
            source: NoOutputSource::WorkerEvent,
            action: StallAction::Interrupt,
        };

        let t2 = Arc::clone(&tracker);
        let watcher_handle = handle.clone();
        let watch = tokio::spawn(run(config, tracker, watcher_handle));

        tokio::time::advance(Duration::from_secs(2)).await;
        t2.mark_worker_output();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!handle.is_aborted());
        watch.abort();
    }
}
