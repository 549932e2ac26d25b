//! # Circuit Breaker
//!
//! A concrete, lock-protected circuit breaker protecting the `UserService`
//! call in the Targeting Service. Implements `CircuitBreakerBehavior` so it
//! can be used uniformly with other breakers in the system (messaging
//! client, future ones) via `dyn CircuitBreakerBehavior`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{CircuitBreakerBehavior, CircuitBreakerMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerRuntimeConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub min_state_transition_interval: Duration,
}

impl Default for CircuitBreakerRuntimeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            min_state_transition_interval: Duration::from_secs(1),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_transition_at: Instant,
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    half_open_calls: u64,
    total_duration: Duration,
}

/// Circuit breaker guarding `UserService` calls from the Targeting Service.
/// `should_allow` transitions Open -> HalfOpen once `timeout` has elapsed,
/// mirroring the classic three-state breaker; a half-open probe that
/// succeeds `success_threshold` times in a row closes the circuit, one
/// failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerRuntimeConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerRuntimeConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_transition_at: Instant::now(),
                total_calls: 0,
                success_count: 0,
                failure_count: 0,
                half_open_calls: 0,
                total_duration: Duration::ZERO,
            }),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state != to {
            inner.state = to;
            inner.last_transition_at = Instant::now();
            if to == CircuitState::Open {
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                inner.half_open_calls += 1;
                true
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.consecutive_successes = 0;
                    inner.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.success_count += 1;
        inner.total_duration += duration;
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.failure_count += 1;
        inner.total_duration += duration;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, CircuitState::Open);
    }

    fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().unwrap();
        let failure_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.failure_count as f64 / inner.total_calls as f64
        };
        let success_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.success_count as f64 / inner.total_calls as f64
        };
        let average_duration = if inner.total_calls == 0 {
            Duration::ZERO
        } else {
            inner.total_duration / inner.total_calls as u32
        };

        CircuitBreakerMetrics {
            total_calls: inner.total_calls,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            consecutive_failures: inner.consecutive_failures as u64,
            half_open_calls: inner.half_open_calls,
            total_duration: inner.total_duration,
            current_state: inner.state,
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerRuntimeConfig {
        CircuitBreakerRuntimeConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(20),
            min_state_transition_interval: Duration::from_millis(0),
        }
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        for _ in 0..3 {
            cb.record_failure(Duration::from_millis(1));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        for _ in 0..3 {
            cb.record_failure(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(Duration::from_millis(1));
        cb.record_success(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        for _ in 0..3 {
            cb.record_failure(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.should_allow());
        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_and_force_closed_override_state() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn metrics_reflect_recorded_calls() {
        let cb = CircuitBreaker::new("user-service", fast_config());
        cb.record_success(Duration::from_millis(10));
        cb.record_failure(Duration::from_millis(30));
        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
    }
}
