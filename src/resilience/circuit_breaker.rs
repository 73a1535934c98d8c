//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, outcomes feed the rolling window
//! - Open: target assumed down, calls fail fast without I/O
//! - Half-Open: exactly one probe call is let through
//!
//! # State Transitions
//! ```text
//! Closed → Open: samples >= volume_threshold and failure% >= error_threshold_percentage
//! Open → Half-Open: reset_timeout elapsed (evaluated on the next admission or state read)
//! Half-Open → Closed: probe succeeds (window reset)
//! Half-Open → Open: probe fails (reset timer restarts)
//! ```
//!
//! # Design Decisions
//! - One breaker per target, created lazily in a shared registry
//! - All reads and transitions of one breaker happen under one lock
//! - Rolling window is split into buckets so old samples age out

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

const WINDOW_BUCKETS: u32 = 10;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// The breaker refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

#[derive(Debug)]
struct Bucket {
    start: Instant,
    successes: u32,
    failures: u32,
}

/// Outcome counts over the last `window`, in fixed-width buckets.
#[derive(Debug)]
struct RollingWindow {
    buckets: VecDeque<Bucket>,
    window: Duration,
    bucket_width: Duration,
}

impl RollingWindow {
    fn new(window: Duration) -> Self {
        let bucket_width = (window / WINDOW_BUCKETS).max(Duration::from_millis(1));
        Self {
            buckets: VecDeque::with_capacity(WINDOW_BUCKETS as usize + 1),
            window,
            bucket_width,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, failure: bool) {
        self.prune(now);
        let needs_bucket = match self.buckets.back() {
            Some(last) => now.saturating_duration_since(last.start) >= self.bucket_width,
            None => true,
        };
        if needs_bucket {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if failure {
                bucket.failures += 1;
            } else {
                bucket.successes += 1;
            }
        }
    }

    /// (total samples, failures) inside the window.
    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(total, failures), b| {
            (total + b.successes + b.failures, failures + b.failures)
        })
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: BreakerState,
    pub total: u32,
    pub failures: u32,
    pub failure_percentage: f64,
}

/// Circuit breaker for one target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

type Transition = Option<(BreakerState, BreakerState)>;

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = RollingWindow::new(Duration::from_millis(config.rolling_window_ms));
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due Open → Half-Open transition.
    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    /// Ask to send a call.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, Rejected> {
        self.try_acquire_at(Instant::now())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let (state, total, failures, transition) = {
            let mut inner = self.lock();
            let transition = self.advance(&mut inner, now);
            let (total, failures) = inner.window.totals(now);
            (inner.state, total, failures, transition)
        };
        self.emit(transition);
        BreakerSnapshot {
            target: self.target.clone(),
            state,
            total,
            failures,
            failure_percentage: percentage(failures, total),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_at(&self, now: Instant) -> BreakerState {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.advance(&mut inner, now);
            (inner.state, transition)
        };
        self.emit(transition);
        state
    }

    fn try_acquire_at(&self, now: Instant) -> Result<BreakerPermit<'_>, Rejected> {
        let (result, transition) = {
            let mut inner = self.lock();
            let transition = self.advance(&mut inner, now);
            let state = inner.state;
            let result = match state {
                BreakerState::Closed => Ok(false),
                BreakerState::HalfOpen if !inner.probe_in_flight => {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
                BreakerState::HalfOpen | BreakerState::Open => Err(Rejected),
            };
            (result, transition)
        };
        self.emit(transition);

        match result {
            Ok(probe) => Ok(BreakerPermit {
                breaker: self,
                probe,
                resolved: false,
            }),
            Err(rejected) => {
                metrics::record_breaker_rejection(&self.target);
                Err(rejected)
            }
        }
    }

    /// Apply the time-driven Open → Half-Open transition.
    fn advance(&self, inner: &mut Inner, now: Instant) -> Transition {
        if inner.state != BreakerState::Open {
            return None;
        }
        let reset = Duration::from_millis(self.config.reset_timeout_ms);
        match inner.opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) >= reset => {
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = false;
                Some((BreakerState::Open, BreakerState::HalfOpen))
            }
            _ => None,
        }
    }

    fn record_at(&self, now: Instant, probe: bool, failure: bool) {
        let transition = {
            let mut inner = self.lock();
            if probe {
                inner.probe_in_flight = false;
            }
            match (inner.state, probe, failure) {
                (BreakerState::HalfOpen, true, false) => {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    inner.window.reset();
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                }
                (BreakerState::HalfOpen, true, true) => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                (BreakerState::Closed, _, _) => {
                    inner.window.record(now, failure);
                    let (total, failures) = inner.window.totals(now);
                    if failure && self.should_trip(total, failures) {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(now);
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                // Late outcomes of calls admitted before the breaker left Closed.
                _ => None,
            }
        };
        self.emit(transition);
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    fn should_trip(&self, total: u32, failures: u32) -> bool {
        total > 0
            && total >= self.config.volume_threshold
            && u64::from(failures) * 100
                >= u64::from(self.config.error_threshold_percentage) * u64::from(total)
    }

    fn emit(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            BreakerState::Open => tracing::warn!(
                target_service = %self.target,
                from = from.as_str(),
                to = to.as_str(),
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                target_service = %self.target,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }
        metrics::record_breaker_transition(&self.target, from, to);
    }
}

fn percentage(failures: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(failures) * 100.0 / f64::from(total)
    }
}

/// Admission to send one call. Report the outcome with [`success`](Self::success)
/// or [`failure`](Self::failure).
///
/// A half-open probe permit dropped without an outcome frees the probe slot
/// and leaves the breaker half-open.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_at(Instant::now(), self.probe, false);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_at(Instant::now(), self.probe, true);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Process-wide set of breakers keyed by target.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker for `target`, created with `config` on first use.
    pub fn get_or_create(&self, target: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                metrics::record_breaker_state(target, BreakerState::Closed);
                Arc::new(CircuitBreaker::new(target, config.clone()))
            })
            .value()
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by target.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold_percentage: 50,
            volume_threshold: 10,
            reset_timeout_ms: 1_000,
            rolling_window_ms: 10_000,
        }
    }

    fn record(breaker: &CircuitBreaker, now: Instant, failure: bool) {
        let permit = breaker.try_acquire_at(now).expect("admitted");
        breaker.record_at(now, permit.is_probe(), failure);
        std::mem::forget(permit);
    }

    #[test]
    fn opens_at_threshold_after_volume() {
        let breaker = CircuitBreaker::new("inventory", config());
        let now = Instant::now();

        for _ in 0..5 {
            record(&breaker, now, false);
        }
        for _ in 0..4 {
            record(&breaker, now, true);
        }
        // 9 samples: below volume threshold.
        assert_eq!(breaker.state_at(now), BreakerState::Closed);

        record(&breaker, now, true);
        assert_eq!(breaker.state_at(now), BreakerState::Open);
        assert_eq!(breaker.try_acquire_at(now).unwrap_err(), Rejected);
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new("inventory", config());
        let now = Instant::now();
        for i in 0..20 {
            record(&breaker, now, i % 3 == 0);
        }
        assert_eq!(breaker.state_at(now), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes_and_resets() {
        let breaker = CircuitBreaker::new("inventory", config());
        let start = Instant::now();
        for _ in 0..10 {
            record(&breaker, start, true);
        }
        assert_eq!(breaker.state_at(start), BreakerState::Open);

        let later = start + Duration::from_millis(999);
        assert!(breaker.try_acquire_at(later).is_err());

        let later = start + Duration::from_millis(1_000);
        let probe = breaker.try_acquire_at(later).expect("probe admitted");
        assert!(probe.is_probe());
        // Only one probe at a time.
        assert!(breaker.try_acquire_at(later).is_err());

        breaker.record_at(later, true, false);
        std::mem::forget(probe);
        assert_eq!(breaker.state_at(later), BreakerState::Closed);

        let mut inner = breaker.lock();
        assert_eq!(inner.window.totals(later), (0, 0));
    }

    #[test]
    fn half_open_probe_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new("inventory", config());
        let start = Instant::now();
        for _ in 0..10 {
            record(&breaker, start, true);
        }

        let probe_at = start + Duration::from_millis(1_500);
        let probe = breaker.try_acquire_at(probe_at).unwrap();
        breaker.record_at(probe_at, probe.is_probe(), true);
        std::mem::forget(probe);
        assert_eq!(breaker.state_at(probe_at), BreakerState::Open);

        // Timer restarted from the failed probe, not the original opening.
        assert!(breaker.try_acquire_at(start + Duration::from_millis(2_200)).is_err());
        assert!(breaker.try_acquire_at(probe_at + Duration::from_millis(1_000)).is_ok());
    }

    #[test]
    fn abandoned_probe_frees_slot() {
        let breaker = CircuitBreaker::new("inventory", config());
        let start = Instant::now();
        for _ in 0..10 {
            record(&breaker, start, true);
        }
        let later = start + Duration::from_secs(2);
        drop(breaker.try_acquire_at(later).unwrap());
        assert_eq!(breaker.state_at(later), BreakerState::HalfOpen);
        assert!(breaker.try_acquire_at(later).unwrap().is_probe());
    }

    #[test]
    fn old_samples_age_out() {
        let breaker = CircuitBreaker::new("inventory", config());
        let start = Instant::now();
        for _ in 0..9 {
            record(&breaker, start, true);
        }
        let later = start + Duration::from_secs(11);
        record(&breaker, later, true);
        assert_eq!(breaker.state_at(later), BreakerState::Closed);
    }

    #[test]
    fn permits_report_outcomes() {
        let breaker = CircuitBreaker::new("inventory", config());
        for _ in 0..10 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total, 10);
        assert_eq!(snapshot.failure_percentage, 100.0);
    }

    #[test]
    fn concurrent_outcomes_are_not_lost() {
        let breaker = Arc::new(CircuitBreaker::new(
            "inventory",
            CircuitBreakerConfig {
                volume_threshold: 100_000,
                ..config()
            },
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        breaker.try_acquire().unwrap().success();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(breaker.snapshot().total, 4_000);
    }

    #[test]
    fn registry_creates_lazily_and_shares() {
        let registry = BreakerRegistry::new();
        assert!(registry.is_empty());
        let a = registry.get_or_create("inventory", &config());
        let b = registry.get_or_create("inventory", &config());
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("billing", &config());
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.target).collect();
        assert_eq!(names, vec!["billing", "inventory"]);
    }
}
