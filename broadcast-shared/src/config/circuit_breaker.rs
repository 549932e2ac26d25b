//! # Circuit Breaker Configuration
//!
//! TOML-facing config for the `UserService` breaker, converted to the
//! `resilience` module's runtime config via `to_resilience_config`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_min_state_transition_interval_seconds")]
    pub min_state_transition_interval_seconds: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_timeout_seconds(),
            min_state_transition_interval_seconds: default_min_state_transition_interval_seconds(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_timeout_seconds() -> u32 {
    30
}
fn default_min_state_transition_interval_seconds() -> f64 {
    1.0
}

impl CircuitBreakerConfig {
    /// Convert to the resilience module's runtime representation.
    pub fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerRuntimeConfig {
        crate::resilience::CircuitBreakerRuntimeConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds as u64),
            min_state_transition_interval: Duration::from_secs_f64(
                self.min_state_transition_interval_seconds,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_resilience_config() {
        let cfg = CircuitBreakerConfig::default();
        let runtime = cfg.to_resilience_config();
        assert_eq!(runtime.failure_threshold, 5);
        assert_eq!(runtime.timeout.as_secs(), 30);
    }
}
