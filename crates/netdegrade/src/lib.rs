//! Shared feature-level negotiation contract for remote endpoints
//! (§4.7): DNS servers tried over TCP / UDP / UDP+EDNS0 degrade to a
//! level they can actually reach and re-probe the best level after a
//! grace period. Individual endpoints plug in their own failure
//! detection and just report outcomes back through [`FeatureDegradation`].

use std::cell::RefCell;
use std::time::{Duration, Instant};

/// How many consecutive failures at the current level trigger a
/// step down.
pub const RETRY_ATTEMPTS: u32 = 3;

/// How long an endpoint is left alone before the ladder resets to
/// `best`, "on the order of minutes" per the shared contract.
pub const GRACE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// A feature ladder rung, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureLevel {
    Tcp,
    Udp,
    UdpEdns0,
}

impl FeatureLevel {
    pub const WORST: Self = Self::Tcp;
    pub const BEST: Self = Self::UdpEdns0;

    fn step_down(self) -> Self {
        match self {
            Self::UdpEdns0 => Self::Udp,
            Self::Udp => Self::Tcp,
            Self::Tcp => Self::Tcp,
        }
    }
}

struct Inner {
    possible: FeatureLevel,
    verified: FeatureLevel,
    n_failed_attempts: u32,
    last_failed_attempt: Option<Instant>,
}

/// Per-endpoint degradation state (§4.7). Cheap to construct; one
/// instance per remote endpoint an endpoint cache keeps around.
pub struct FeatureDegradation {
    inner: RefCell<Inner>,
}

impl Default for FeatureDegradation {
    fn default() -> Self {
        Self {
            inner: RefCell::new(Inner {
                possible: FeatureLevel::BEST,
                verified: FeatureLevel::WORST,
                n_failed_attempts: 0,
                last_failed_attempt: None,
            }),
        }
    }
}

impl FeatureDegradation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the three ordering rules and returns the level the
    /// next operation should attempt. Must be called immediately
    /// before each attempt; `now` is the caller's clock so tests can
    /// drive grace-window expiry without sleeping.
    pub fn level_for_attempt(&self, now: Instant) -> FeatureLevel {
        let mut inner = self.inner.borrow_mut();

        if let Some(last_failed) = inner.last_failed_attempt {
            if now.saturating_duration_since(last_failed) > GRACE_WINDOW {
                tracing::info!("grace period over");
                inner.possible = FeatureLevel::BEST;
                inner.n_failed_attempts = 0;
                inner.last_failed_attempt = None;
                return inner.possible;
            }
        }

        if inner.possible < inner.verified {
            inner.possible = inner.verified;
        } else if inner.n_failed_attempts >= RETRY_ATTEMPTS && inner.possible > FeatureLevel::WORST {
            tracing::info!("degraded feature set");
            inner.possible = inner.possible.step_down();
            inner.n_failed_attempts = 0;
        }

        inner.possible
    }

    /// Report that an attempt at `level` succeeded; promotes
    /// `verified` if this was a new high-water mark.
    pub fn record_success(&self, level: FeatureLevel) {
        let mut inner = self.inner.borrow_mut();
        if level > inner.verified {
            inner.verified = level;
        }
        inner.n_failed_attempts = 0;
        inner.last_failed_attempt = None;
    }

    /// Report that an attempt failed at `now`.
    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.borrow_mut();
        inner.n_failed_attempts += 1;
        inner.last_failed_attempt = Some(now);
    }

    pub fn possible(&self) -> FeatureLevel {
        self.inner.borrow().possible
    }

    pub fn verified(&self) -> FeatureLevel {
        self.inner.borrow().verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_best_possible_and_worst_verified() {
        let state = FeatureDegradation::new();
        assert_eq!(state.possible(), FeatureLevel::BEST);
        assert_eq!(state.verified(), FeatureLevel::WORST);
    }

    #[test]
    fn repeated_failures_within_grace_window_decrement_possible_once() {
        let state = FeatureDegradation::new();
        let t0 = Instant::now();

        for i in 0..RETRY_ATTEMPTS {
            let level = state.level_for_attempt(t0 + Duration::from_secs(i as u64));
            state.record_failure(t0 + Duration::from_secs(i as u64));
            let _ = level;
        }

        // One more attempt observes n_failed_attempts >= RETRY_ATTEMPTS and steps down.
        let level = state.level_for_attempt(t0 + Duration::from_secs(RETRY_ATTEMPTS as u64));
        assert_eq!(level, FeatureLevel::Udp);
    }

    #[test]
    fn grace_window_elapsing_resets_to_best() {
        let state = FeatureDegradation::new();
        let t0 = Instant::now();

        for i in 0..=RETRY_ATTEMPTS {
            state.level_for_attempt(t0 + Duration::from_secs(i as u64));
            state.record_failure(t0 + Duration::from_secs(i as u64));
        }
        assert_eq!(state.possible(), FeatureLevel::Udp);

        let after_grace = t0 + Duration::from_secs(RETRY_ATTEMPTS as u64) + GRACE_WINDOW + Duration::from_secs(1);
        let level = state.level_for_attempt(after_grace);
        assert_eq!(level, FeatureLevel::BEST);
    }

    #[test]
    fn success_promotes_verified_and_clears_failure_counter() {
        let state = FeatureDegradation::new();
        let t0 = Instant::now();

        state.record_failure(t0);
        state.record_success(FeatureLevel::Udp);

        assert_eq!(state.verified(), FeatureLevel::Udp);
        // A fresh attempt should not see leftover failures.
        let level = state.level_for_attempt(t0 + Duration::from_secs(1));
        assert_eq!(level, FeatureLevel::BEST);
    }

    #[test]
    fn possible_never_degrades_below_worst() {
        let state = FeatureDegradation::new();
        let t0 = Instant::now();

        let mut t = t0;
        for _ in 0..10 {
            for _ in 0..RETRY_ATTEMPTS {
                state.level_for_attempt(t);
                state.record_failure(t);
                t += Duration::from_secs(1);
            }
        }

        assert_eq!(state.possible(), FeatureLevel::WORST);
    }
}
