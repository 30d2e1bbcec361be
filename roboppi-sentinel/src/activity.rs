//! Per-step activity tracking (spec.md §4.12's no-output watcher): three
//! timestamps — last worker output, last phase transition, last state
//! update — plus a flag for "no worker event has ever been observed",
//! which distinguishes batch-mode workers that emit nothing until
//! completion from a genuinely stalled streaming worker.

use parking_lot::Mutex;
use roboppi_common::workflow::NoOutputSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub struct ActivityTracker {
    started_at: Instant,
    last_worker_output: Mutex<Instant>,
    last_phase_transition: Mutex<Instant>,
    last_state_update: Mutex<Instant>,
    ever_observed_worker_output: AtomicBool,
}

impl ActivityTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_worker_output: Mutex::new(now),
            last_phase_transition: Mutex::new(now),
            last_state_update: Mutex::new(now),
            ever_observed_worker_output: AtomicBool::new(false),
        }
    }

    pub fn mark_worker_output(&self) {
        *self.last_worker_output.lock() = Instant::now();
        self.ever_observed_worker_output.store(true, Ordering::SeqCst);
    }

    pub fn mark_phase_transition(&self) {
        *self.last_phase_transition.lock() = Instant::now();
    }

    pub fn mark_state_update(&self) {
        *self.last_state_update.lock() = Instant::now();
    }

    pub fn has_observed_worker_output(&self) -> bool {
        self.ever_observed_worker_output.load(Ordering::SeqCst)
    }

    /// The reference timestamp a given `NoOutputSource` should measure
    /// elapsed time from (spec.md §4.12).
    pub fn reference(&self, source: NoOutputSource) -> Instant {
        match source {
            NoOutputSource::WorkerEvent => *self.last_worker_output.lock(),
            NoOutputSource::AnyEvent => {
                let candidates = [
                    *self.last_worker_output.lock(),
                    *self.last_phase_transition.lock(),
                    *self.last_state_update.lock(),
                ];
                candidates.into_iter().max().unwrap_or(self.started_at)
            }
            // `ProbeOnly` never uses the no-output watcher's reference
            // timestamp at all (its trigger is the no-progress probe
            // instead) — fall back to start time so a caller that checks
            // it anyway sees the full elapsed wall time.
            NoOutputSource::ProbeOnly => self.started_at,
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn worker_event_reference_tracks_last_output() {
        let tracker = ActivityTracker::new();
        assert!(!tracker.has_observed_worker_output());
        std::thread::sleep(Duration::from_millis(5));
        tracker.mark_worker_output();
        assert!(tracker.has_observed_worker_output());
        let elapsed = tracker.reference(NoOutputSource::WorkerEvent).elapsed();
        assert!(elapsed < Duration::from_millis(50));
    }

    #[test]
    fn any_event_reference_takes_the_most_recent() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(5));
        tracker.mark_phase_transition();
        let ref_ts = tracker.reference(NoOutputSource::AnyEvent);
        assert!(ref_ts.elapsed() < Duration::from_millis(50));
    }
}
