//! Per-model circuit breakers.
//!
//! Lock-free state machine driven by atomic CAS. Two composed flavors:
//! the base breaker opens after a run of consecutive failures and cools
//! down into half-open with a single admitted probe; the adaptive layer
//! additionally counts slow requests (latency over a threshold) and can
//! open without outright failures. A timeout counts as both a failure
//! and a slow sample.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// A per-model breaker. All mutation is atomic; no locks are held.
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    slow_count: AtomicU32,
    opened_at_epoch: AtomicU64,
    /// Set once the half-open probe slot is taken.
    probe_taken: AtomicBool,

    threshold: u32,
    cooldown: Duration,
    slow_limit: u32,
    latency_threshold: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            slow_count: AtomicU32::new(0),
            opened_at_epoch: AtomicU64::new(0),
            probe_taken: AtomicBool::new(false),
            threshold,
            cooldown,
            // Adaptive defaults: ten slow responses over 10s each trip it.
            slow_limit: 10,
            latency_threshold: Duration::from_secs(10),
        }
    }

    pub fn with_adaptive(mut self, slow_limit: u32, latency_threshold: Duration) -> Self {
        self.slow_limit = slow_limit;
        self.latency_threshold = latency_threshold;
        self
    }

    fn now_epoch() -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// May a request proceed right now?
    ///
    /// Open breakers transition to half-open once the cooldown elapses;
    /// half-open admits exactly one probe until an outcome is recorded.
    pub fn can_request(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => {
                let opened_at = self.opened_at_epoch.load(Ordering::Acquire);
                if Self::now_epoch().saturating_sub(opened_at) < self.cooldown.as_secs() {
                    return false;
                }
                // Cooldown over: move to half-open and claim the probe.
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.probe_taken.store(true, Ordering::Release);
                    true
                } else {
                    // Another caller won the race; they own the probe.
                    false
                }
            }
            _ => {
                // Half-open: only the probe slot may pass.
                self.probe_taken
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
        }
    }

    pub fn record_success(&self, latency: Duration) {
        if latency >= self.latency_threshold {
            self.record_slow();
        } else {
            self.slow_count.store(0, Ordering::Release);
        }
        self.consecutive_failures.store(0, Ordering::Release);
        // A successful probe closes the breaker.
        if self.state.load(Ordering::Acquire) == HALF_OPEN {
            self.close();
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.state.load(Ordering::Acquire);
        if state == HALF_OPEN || failures >= self.threshold {
            self.open();
        }
    }

    /// Timeouts count as a failure and as a slow sample.
    pub fn record_timeout(&self) {
        self.record_slow();
        self.record_failure();
    }

    /// Record a slow response. Trips the breaker when the adaptive slow
    /// limit accumulates, even with zero hard failures.
    pub fn record_slow(&self) {
        let slow = self.slow_count.fetch_add(1, Ordering::AcqRel) + 1;
        if slow >= self.slow_limit {
            self.open();
        }
    }

    fn open(&self) {
        self.state.store(OPEN, Ordering::Release);
        self.opened_at_epoch.store(Self::now_epoch(), Ordering::Release);
        self.probe_taken.store(false, Ordering::Release);
        self.slow_count.store(0, Ordering::Release);
    }

    fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.slow_count.store(0, Ordering::Release);
        self.probe_taken.store(false, Ordering::Release);
    }
}
