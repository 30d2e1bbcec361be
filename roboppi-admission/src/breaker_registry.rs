//! Circuit breaker registry: one breaker per provider id, with an atomic
//! snapshot read used by the permit gate (spec.md §4.2).
//!
//! Shaped after the teacher's per-endpoint `CircuitBreakerRegistry`
//! (`Arc<Mutex<HashMap<endpoint, breaker>>>`), swapped to `dashmap` for
//! lock-free per-key access since the registry is read far more often
//! (one snapshot per `requestPermit`) than it is written.

use dashmap::DashMap;
use parking_lot::Mutex;
use roboppi_common::{BreakerSnapshot, BreakerState, ProviderId};
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

struct Breaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl Breaker {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            open_duration,
        }
    }

    fn state(&self, provider: &str) -> BreakerState {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    info!(provider, "circuit breaker half-open after cooldown");
                }
            }
        }
        inner.state
    }

    fn record_success(&self, provider: &str) {
        let mut inner = self.inner.lock();
        let was_open = inner.state != BreakerState::Closed;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        if was_open {
            info!(provider, "circuit breaker closed after success");
        }
    }

    fn record_failure(&self, provider: &str) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(provider, "circuit breaker re-opened after half-open probe failure");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        provider,
                        failures = inner.consecutive_failures,
                        "circuit breaker tripped open"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Maps provider id to breaker state machine (spec.md §4.2).
pub struct CircuitBreakerRegistry {
    breakers: DashMap<ProviderId, Breaker>,
    default_failure_threshold: u32,
    default_open_duration: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(default_failure_threshold: u32, default_open_duration: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            default_failure_threshold,
            default_open_duration,
        }
    }

    // Entry-insertion is racy against a concurrent get, so loop rather
    // than assume a single insert-then-get is enough.
    fn get_or_create(&self, provider: &str) -> dashmap::mapref::one::Ref<'_, ProviderId, Breaker> {
        loop {
            if let Some(existing) = self.breakers.get(provider) {
                return existing;
            }
            self.breakers.entry(provider.to_string()).or_insert_with(|| {
                Breaker::new(self.default_failure_threshold, self.default_open_duration)
            });
        }
    }

    pub fn record_success(&self, provider: &str) {
        self.get_or_create(provider).record_success(provider);
    }

    pub fn record_failure(&self, provider: &str) {
        self.get_or_create(provider).record_failure(provider);
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.get_or_create(provider).state(provider)
    }

    /// An atomic point-in-time snapshot of every known provider's state
    /// (spec.md §9's open-question answer: callers must re-evaluate this
    /// on every `requestPermit`, including retries — never cache it).
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state(entry.key())))
            .collect()
    }
}
