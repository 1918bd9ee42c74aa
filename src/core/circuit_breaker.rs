//! Circuit Breaker Implementation
//!
//! One breaker per downstream endpoint keeps a failing instance from dragging
//! the gateway down with it.
//!
//! ## States:
//! - **Closed**: requests pass through; outcomes are sampled in a rolling window
//! - **Open**: requests fail fast until the cooldown has elapsed
//! - **HalfOpen**: a single trial request decides between Closed and Open
//!
//! Outcomes are not tied to the admission that produced them. While half-open,
//! whichever outcome is recorded first settles the trial.
//!
//! Each breaker guards its own state with a `parking_lot::Mutex`, so unrelated
//! endpoints never contend. Breakers live in a `DashMap` keyed by endpoint
//! identity and are created lazily on first use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::config::CircuitBreakerSettings;
use crate::core::error::CircuitOpenError;
use crate::core::types::ServiceEndpoint;

/// Public breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view of a breaker's state
#[derive(Debug, Clone, Serialize)]
pub struct CircuitState {
    pub endpoint_key: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub window_failure_ratio: f64,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Configuration for one breaker, derived from its endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Disabled breakers admit everything and ignore outcomes
    pub enabled: bool,

    /// Failure ratio the window must exceed to open
    pub failure_threshold: f64,

    /// Time spent Open before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Number of recent outcomes considered
    pub sampling_window: usize,

    /// Outcomes required before the ratio is acted on
    pub minimum_throughput: usize,
}

impl CircuitBreakerConfig {
    pub fn for_endpoint(endpoint: &ServiceEndpoint, settings: &CircuitBreakerSettings) -> Self {
        Self {
            enabled: endpoint.circuit_breaker_enabled,
            failure_threshold: endpoint.failure_threshold,
            cooldown: endpoint.cooldown,
            sampling_window: settings.sampling_window.max(1),
            minimum_throughput: settings.minimum_throughput.max(1),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            sampling_window: 10,
            minimum_throughput: 3,
        }
    }
}

/// Counters collected by the circuit breaker
///
/// Uses atomic operations for lock-free updates from multiple threads
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub admitted_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub circuit_opened_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            admitted_requests: self.admitted_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub admitted_requests: u64,
    pub rejected_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub circuit_opened_count: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    /// `trial_started` is when the single trial request was handed out
    HalfOpen { trial_started: Instant },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: u32,
    /// `true` for a failure, newest at the back
    window: VecDeque<bool>,
    opened_at_wall: Option<DateTime<Utc>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            opened_at_wall: None,
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }

    fn push(&mut self, failed: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
        self.consecutive_failures = 0;
        self.window.clear();
        self.opened_at_wall = None;
    }

    fn open(&mut self, now: Instant) {
        self.phase = Phase::Open { opened_at: now };
        self.opened_at_wall = Some(Utc::now());
    }
}

/// Per-endpoint circuit breaker
pub struct CircuitBreaker {
    endpoint_key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Arc<CircuitBreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(endpoint_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint_key: endpoint_key.into(),
            config,
            inner: Mutex::new(Inner::new()),
            metrics: Arc::new(CircuitBreakerMetrics::default()),
        }
    }

    /// Ask to send one request through the breaker
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        self.try_acquire_at(Instant::now())
    }

    /// [`try_acquire`](Self::try_acquire) against an explicit instant
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), CircuitOpenError> {
        if !self.config.enabled {
            self.metrics.admitted_requests.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let admitted = match inner.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    inner.phase = Phase::HalfOpen { trial_started: now };
                    info!(endpoint = %self.endpoint_key, "Circuit half-open, admitting trial request");
                    true
                } else {
                    false
                }
            }
            // A trial that never reported back frees its slot after one cooldown
            Phase::HalfOpen { trial_started } => {
                if now.saturating_duration_since(trial_started) >= self.config.cooldown {
                    inner.phase = Phase::HalfOpen { trial_started: now };
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);

        if admitted {
            self.metrics.admitted_requests.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
            Err(CircuitOpenError {
                endpoint: self.endpoint_key.clone(),
            })
        }
    }

    /// Record a successful downstream call
    pub fn record_success(&self) {
        self.record_success_at(Instant::now())
    }

    pub fn record_success_at(&self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        self.metrics.successful_requests.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => {
                inner.consecutive_failures = 0;
                inner.push(false, self.config.sampling_window);
                self.trip_if_needed(&mut inner, now);
            }
            Phase::HalfOpen { .. } => {
                inner.close();
                info!(endpoint = %self.endpoint_key, "Trial request succeeded, circuit closed");
            }
            // Late result from a request admitted before the circuit opened
            Phase::Open { .. } => {}
        }
    }

    /// Record a failed downstream call
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => {
                inner.consecutive_failures += 1;
                inner.push(true, self.config.sampling_window);
                self.trip_if_needed(&mut inner, now);
            }
            Phase::HalfOpen { .. } => {
                inner.consecutive_failures += 1;
                inner.open(now);
                self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %self.endpoint_key, "Trial request failed, circuit re-opened");
            }
            Phase::Open { .. } => {}
        }
    }

    fn trip_if_needed(&self, inner: &mut Inner, now: Instant) {
        if inner.window.len() < self.config.minimum_throughput {
            return;
        }
        let ratio = inner.failure_ratio();
        if ratio > self.config.failure_threshold {
            inner.open(now);
            self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                endpoint = %self.endpoint_key,
                failure_ratio = ratio,
                threshold = self.config.failure_threshold,
                cooldown = %humantime::format_duration(self.config.cooldown),
                "Circuit opened"
            );
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        let status = match inner.phase {
            Phase::Closed => CircuitStatus::Closed,
            Phase::Open { .. } => CircuitStatus::Open,
            Phase::HalfOpen { .. } => CircuitStatus::HalfOpen,
        };
        CircuitState {
            endpoint_key: self.endpoint_key.clone(),
            status,
            consecutive_failures: inner.consecutive_failures,
            window_failure_ratio: inner.failure_ratio(),
            opened_at: inner.opened_at_wall,
        }
    }

    pub fn endpoint_key(&self) -> &str {
        &self.endpoint_key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CircuitBreakerMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Breaker with its state and counters, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub config: CircuitBreakerConfig,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

/// Circuit breakers for every endpoint seen so far
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// Get the breaker for an endpoint, creating it on first use
    pub fn get_or_create(&self, endpoint: &ServiceEndpoint) -> Arc<CircuitBreaker> {
        let key = endpoint.key();
        if let Some(breaker) = self.breakers.get(&key) {
            return Arc::clone(breaker.value());
        }

        let config = CircuitBreakerConfig::for_endpoint(endpoint, &self.settings);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config)))
            .value()
            .clone()
    }

    pub fn get(&self, endpoint_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(endpoint_key).map(|b| Arc::clone(b.value()))
    }

    /// Drop the breaker for `endpoint` if it was built from different
    /// settings; returns whether one was dropped
    pub fn discard_if_stale(&self, endpoint: &ServiceEndpoint) -> bool {
        let expected = CircuitBreakerConfig::for_endpoint(endpoint, &self.settings);
        self.breakers
            .remove_if(&endpoint.key(), |_, breaker| breaker.config() != &expected)
            .is_some()
    }

    /// Drop a breaker; the next use starts from Closed
    pub fn remove(&self, endpoint_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(endpoint_key).map(|(_, breaker)| breaker)
    }

    /// Snapshots ordered by endpoint key
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<CircuitBreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                CircuitBreakerSnapshot {
                    state: breaker.state(),
                    config: breaker.config().clone(),
                    metrics: breaker.metrics().snapshot(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.state.endpoint_key.cmp(&b.state.endpoint_key));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn reset(&self) {
        self.breakers.clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: f64, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "billing@http://billing:8080",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
                ..CircuitBreakerConfig::default()
            },
        )
    }

    /// Drives the breaker into Open with two failures out of three calls
    fn trip(cb: &CircuitBreaker, now: Instant) {
        for failed in [true, false, true] {
            cb.try_acquire_at(now).unwrap();
            if failed {
                cb.record_failure_at(now);
            } else {
                cb.record_success_at(now);
            }
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let state = cb.state();

        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.window_failure_ratio, 0.0);
        assert!(state.opened_at.is_none());
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_on_two_failures_out_of_three() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();
        trip(&cb, now);

        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert!(state.opened_at.is_some());
        assert!((state.window_failure_ratio - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(cb.metrics().snapshot().circuit_opened_count, 1);
    }

    #[test]
    fn test_failures_then_success_still_trips() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state().status, CircuitStatus::Closed);

        cb.record_success_at(now);
        assert_eq!(cb.state().status, CircuitStatus::Open);
    }

    #[test]
    fn test_ratio_equal_to_threshold_stays_closed() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();

        for failed in [false, true, false, true] {
            if failed {
                cb.record_failure_at(now);
            } else {
                cb.record_success_at(now);
            }
        }

        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.window_failure_ratio, 0.5);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(0.9, Duration::from_secs(30));
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state().consecutive_failures, 2);

        cb.record_success_at(now);
        assert_eq!(cb.state().consecutive_failures, 0);
    }

    #[test]
    fn test_open_rejects_within_cooldown() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();
        trip(&cb, now);

        let err = cb.try_acquire_at(now + Duration::from_secs(29)).unwrap_err();
        assert_eq!(err.endpoint, "billing@http://billing:8080");
        assert_eq!(cb.state().status, CircuitStatus::Open);
        assert_eq!(cb.metrics().snapshot().rejected_requests, 1);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();
        trip(&cb, now);

        let later = now + Duration::from_secs(30);
        assert!(cb.try_acquire_at(later).is_ok());
        assert_eq!(cb.state().status, CircuitStatus::HalfOpen);

        // Only one trial while it is outstanding
        assert!(cb.try_acquire_at(later).is_err());
        assert!(cb.try_acquire_at(later + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();
        trip(&cb, now);

        let later = now + Duration::from_secs(31);
        cb.try_acquire_at(later).unwrap();
        cb.record_failure_at(later);

        assert_eq!(cb.state().status, CircuitStatus::Open);
        assert_eq!(cb.metrics().snapshot().circuit_opened_count, 2);
        // Cooldown restarts from the failed trial
        assert!(cb.try_acquire_at(later + Duration::from_secs(29)).is_err());
        assert!(cb.try_acquire_at(later + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_successful_trial_closes_and_resets() {
        let cb = breaker(0.5, Duration::from_secs(30));
        let now = Instant::now();
        trip(&cb, now);

        let later = now + Duration::from_secs(31);
        cb.try_acquire_at(later).unwrap();
        cb.record_success_at(later);

        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.window_failure_ratio, 0.0);
        assert!(state.opened_at.is_none());
    }

    #[test]
    fn test_abandoned_trial_frees_slot_after_cooldown() {
        let cb = breaker(0.5, Duration::from_secs(10));
        let now = Instant::now();
        trip(&cb, now);

        let trial = now + Duration::from_secs(10);
        cb.try_acquire_at(trial).unwrap();
        assert!(cb.try_acquire_at(trial + Duration::from_secs(9)).is_err());
        assert!(cb.try_acquire_at(trial + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_transitions_to_half_open_with_real_clock() {
        let cb = breaker(0.5, Duration::from_millis(100));
        trip(&cb, Instant::now());
        assert!(cb.try_acquire().is_err());

        thread::sleep(Duration::from_millis(150));

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state().status, CircuitStatus::HalfOpen);
    }

    #[test]
    fn test_disabled_breaker_always_admits() {
        let cb = CircuitBreaker::new(
            "users@http://users:8080",
            CircuitBreakerConfig {
                enabled: false,
                ..CircuitBreakerConfig::default()
            },
        );
        let now = Instant::now();

        for _ in 0..20 {
            assert!(cb.try_acquire_at(now).is_ok());
            cb.record_failure_at(now);
        }

        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_window_only_keeps_recent_outcomes() {
        let cb = CircuitBreaker::new(
            "audit@http://audit:8080",
            CircuitBreakerConfig {
                failure_threshold: 0.5,
                sampling_window: 4,
                minimum_throughput: 4,
                ..CircuitBreakerConfig::default()
            },
        );
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        for _ in 0..4 {
            cb.record_success_at(now);
        }
        cb.record_failure_at(now);

        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.window_failure_ratio, 0.25);
    }

    #[test]
    fn test_registry_creates_lazily_and_reuses() {
        let registry = CircuitBreakerRegistry::default();
        let endpoint = ServiceEndpoint::new("billing", "http://billing:8080")
            .with_cooldown(Duration::from_secs(5));

        assert!(registry.is_empty());
        let first = registry.get_or_create(&endpoint);
        let second = registry.get_or_create(&endpoint);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().cooldown, Duration::from_secs(5));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&endpoint.key()).is_some());
        assert!(registry.get(&endpoint.key()).is_none());
    }

    #[test]
    fn test_registry_snapshots_are_sorted() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create(&ServiceEndpoint::new("users", "http://users:8080"));
        registry.get_or_create(&ServiceEndpoint::new("audit", "http://audit:8080"));

        let keys: Vec<String> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.state.endpoint_key)
            .collect();
        assert_eq!(keys, vec!["audit@http://audit:8080", "users@http://users:8080"]);

        registry.reset();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_breaker_is_discarded() {
        let registry = CircuitBreakerRegistry::default();
        let original = ServiceEndpoint::new("users", "http://users:8080");
        let retuned = original
            .clone()
            .with_failure_threshold(0.9)
            .with_cooldown(Duration::from_secs(300));

        registry.get_or_create(&original);
        assert!(!registry.discard_if_stale(&original));
        assert_eq!(registry.len(), 1);

        assert!(registry.discard_if_stale(&retuned));
        assert!(registry.is_empty());

        let breaker = registry.get_or_create(&retuned);
        assert_eq!(breaker.config().failure_threshold, 0.9);
        assert_eq!(breaker.config().cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_concurrent_outcomes_are_all_counted() {
        let cb = Arc::new(CircuitBreaker::new(
            "identity@http://identity:8080",
            CircuitBreakerConfig {
                failure_threshold: 1.0,
                ..CircuitBreakerConfig::default()
            },
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..100 {
                        cb.try_acquire().unwrap();
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = cb.metrics().snapshot();
        assert_eq!(metrics.admitted_requests, 800);
        assert_eq!(metrics.failed_requests, 800);
        assert_eq!(cb.state().consecutive_failures, 800);
    }
}
