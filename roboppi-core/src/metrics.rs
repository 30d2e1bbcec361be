//! Supervisor-wide metrics (SPEC_FULL.md's ambient metrics surface).
//!
//! Counters are plain atomics rather than the teacher's `Mutex`-guarded
//! snapshot structs (`knhk-sidecar::metrics`), to stay consistent with
//! `roboppi-admission`'s `#![deny(clippy::expect_used)]` posture: a
//! poisoned mutex has no recovery path worth an `.expect()` here, and
//! atomics sidestep the question entirely.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub permits_granted: u64,
    pub permits_rejected: u64,
    pub permits_revoked: u64,
    pub breaker_trips: u64,
    pub active_permits: u64,
    pub active_workers: u64,
    pub stall_triggers: u64,
    pub escalations_raised: u64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    permits_granted: AtomicU64,
    permits_rejected: AtomicU64,
    permits_revoked: AtomicU64,
    breaker_trips: AtomicU64,
    active_permits: AtomicU64,
    active_workers: AtomicU64,
    stall_triggers: AtomicU64,
    escalations_raised: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_permit_granted(&self) {
        self.permits_granted.fetch_add(1, Ordering::Relaxed);
        self.active_permits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_rejected(&self) {
        self.permits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_completed(&self) {
        self.active_permits.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_permit_revoked(&self) {
        self.permits_revoked.fetch_add(1, Ordering::Relaxed);
        self.active_permits.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_stall_trigger(&self) {
        self.stall_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            permits_granted: self.permits_granted.load(Ordering::Relaxed),
            permits_rejected: self.permits_rejected.load(Ordering::Relaxed),
            permits_revoked: self.permits_revoked.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            active_permits: self.active_permits.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            stall_triggers: self.stall_triggers.load(Ordering::Relaxed),
            escalations_raised: self.escalations_raised.load(Ordering::Relaxed),
        }
    }
}

/// Spawns a background task that logs a snapshot on `interval` until the
/// runtime shuts down. Fire-and-forget: the handle is dropped at the
/// caller's discretion, matching the teacher's reporting-loop shape in
/// `knhk-sidecar`.
pub fn spawn_reporter(collector: Arc<MetricsCollector>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = collector.snapshot();
            tracing::info!(
                permits_granted = snapshot.permits_granted,
                permits_rejected = snapshot.permits_rejected,
                permits_revoked = snapshot.permits_revoked,
                breaker_trips = snapshot.breaker_trips,
                active_permits = snapshot.active_permits,
                active_workers = snapshot.active_workers,
                stall_triggers = snapshot.stall_triggers,
                escalations_raised = snapshot.escalations_raised,
                "metrics snapshot"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_grant_and_completion() {
        let collector = MetricsCollector::new();
        collector.record_permit_granted();
        collector.record_permit_granted();
        collector.record_permit_completed();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.permits_granted, 2);
        assert_eq!(snapshot.active_permits, 1);
    }

    #[test]
    fn rejection_does_not_touch_active_count() {
        let collector = MetricsCollector::new();
        collector.record_permit_rejected();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.permits_rejected, 1);
        assert_eq!(snapshot.active_permits, 0);
    }
}
