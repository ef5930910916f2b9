//! Per-(pool, host) circuit breaking.
//!
//! Closed state records outcomes in a rolling time window; once the sample
//! count reaches `min_requests` and the failure ratio reaches
//! `failure_ratio`, the breaker opens. Open short-circuits callers for
//! `open_timeout`, then half-open admits up to `half_open_probes` concurrent
//! probes: one failure reopens, a full set of successes closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metric_names;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum samples in the window before the ratio is evaluated.
    pub min_requests: u32,
    /// Rolling window over which outcomes are counted.
    pub window: Duration,
    /// Failure ratio (0.0 - 1.0) that opens the breaker.
    pub failure_ratio: f64,
    /// How long an open breaker short-circuits before probing.
    pub open_timeout: Duration,
    /// Concurrent probes admitted in half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            window: Duration::from_secs(60),
            failure_ratio: 0.5,
            open_timeout: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub pool: Arc<str>,
    pub host: Arc<str>,
}

impl BreakerKey {
    pub fn new(pool: &str, host: &str) -> Self {
        Self {
            pool: Arc::from(pool),
            host: Arc::from(host),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
    rejected: u64,
}

pub struct HostBreaker {
    key: BreakerKey,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl HostBreaker {
    fn new(key: BreakerKey, config: BreakerConfig) -> Self {
        Self {
            key,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
                rejected: 0,
            }),
        }
    }

    fn prune(window: &mut VecDeque<(Instant, bool)>, horizon: Duration) {
        let cutoff = Instant::now() - horizon;
        while window.front().is_some_and(|(t, _)| *t < cutoff) {
            window.pop_front();
        }
    }

    /// Decide whether an outbound call may proceed. A denied call is
    /// recorded as rejected and never reaches the network.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    self.publish_state(inner.state);
                    debug!(pool = %self.key.pool, host = %self.key.host, "breaker half-open, probing");
                    true
                } else {
                    inner.rejected += 1;
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    inner.rejected += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back((Instant::now(), true));
                Self::prune(&mut inner.window, self.config.window);
            }
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_probes {
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    self.publish_state(inner.state);
                    debug!(pool = %self.key.pool, host = %self.key.host, "breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back((Instant::now(), false));
                Self::prune(&mut inner.window, self.config.window);

                let samples = inner.window.len() as u32;
                if samples >= self.config.min_requests {
                    let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
                    let ratio = failures as f64 / samples as f64;
                    if ratio >= self.config.failure_ratio {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        self.publish_state(inner.state);
                        warn!(
                            pool = %self.key.pool,
                            host = %self.key.host,
                            samples,
                            failure_ratio = ratio,
                            "circuit breaker opened"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                self.publish_state(inner.state);
                warn!(pool = %self.key.pool, host = %self.key.host, "probe failed, breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn publish_state(&self, state: BreakerState) {
        metric_names::set_circuit_breaker_state(&self.key.pool, &self.key.host, state.as_gauge());
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner.window, self.config.window);
        let samples = inner.window.len() as u32;
        let failures = inner.window.iter().filter(|(_, ok)| !ok).count() as u32;
        BreakerStats {
            pool: self.key.pool.to_string(),
            host: self.key.host.to_string(),
            state: inner.state,
            window_samples: samples,
            window_failures: failures,
            rejected_calls: inner.rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub pool: String,
    pub host: String,
    pub state: BreakerState,
    pub window_samples: u32,
    pub window_failures: u32,
    pub rejected_calls: u64,
}

/// Registry of breakers keyed by `(pool, host)`.
pub struct BreakerRegistry {
    breakers: DashMap<BreakerKey, Arc<HostBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn breaker(&self, pool: &str, host: &str) -> Arc<HostBreaker> {
        let key = BreakerKey::new(pool, host);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(HostBreaker::new(key, self.config.clone())))
            .clone()
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|e| e.value().stats()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|e| e.value().state() == BreakerState::Open)
            .count()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            min_requests: 4,
            window: Duration::from_secs(60),
            failure_ratio: 0.5,
            open_timeout: Duration::from_millis(50),
            half_open_probes: 2,
        }
    }

    #[test]
    fn opens_on_failure_ratio_after_min_samples() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.breaker("P", "api.example.com");

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed); // below min_requests

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn ratio_below_threshold_stays_closed() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.breaker("P", "api.example.com");

        for _ in 0..6 {
            breaker.record_success();
        }
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_cycle() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.breaker("P", "api.example.com");

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First call after the open timeout becomes a probe.
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow_request()); // second probe slot
        assert!(!breaker.allow_request()); // probe budget spent

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.breaker("P", "api.example.com");

        for _ in 0..4 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn breakers_are_isolated_per_pool_and_host() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.breaker("P1", "api.example.com");
        for _ in 0..4 {
            a.record_failure();
        }

        assert_eq!(a.state(), BreakerState::Open);
        assert_eq!(
            registry.breaker("P2", "api.example.com").state(),
            BreakerState::Closed
        );
        assert_eq!(
            registry.breaker("P1", "other.example.com").state(),
            BreakerState::Closed
        );
        assert_eq!(registry.open_count(), 1);
    }
}
