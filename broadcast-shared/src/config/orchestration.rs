//! # Orchestration Configuration
//!
//! Settings for the lifecycle, targeting, scheduler, outbox-publisher and
//! DLT-redrive subsystems.

use serde::{Deserialize, Serialize};

use super::CircuitBreakerConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub targeting: TargetingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            targeting: TargetingConfig::default(),
            scheduler: SchedulerConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_orchestration_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_orchestration_port(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_orchestration_port() -> u16 {
    3000
}

/// Targeting Service tuning, including its `UserService` circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetingConfig {
    /// Lower bound of the precompute prefetch window, `userFetchDelayMs`.
    #[serde(default = "default_user_fetch_delay_ms")]
    pub user_fetch_delay_ms: u64,
    /// Safety buffer added on top of `user_fetch_delay_ms` (2 min default).
    #[serde(default = "default_precompute_safety_buffer_ms")]
    pub precompute_safety_buffer_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Max concurrent in-flight `UserService` calls (bulkhead).
    #[serde(default = "default_bulkhead_limit")]
    pub bulkhead_limit: usize,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            user_fetch_delay_ms: default_user_fetch_delay_ms(),
            precompute_safety_buffer_ms: default_precompute_safety_buffer_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead_limit: default_bulkhead_limit(),
        }
    }
}

fn default_user_fetch_delay_ms() -> u64 {
    5 * 60 * 1000
}
fn default_precompute_safety_buffer_ms() -> u64 {
    2 * 60 * 1000
}
fn default_bulkhead_limit() -> usize {
    16
}

/// Scheduler tick settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_activation_tick_period_ms")]
    pub activation_tick_period_ms: u64,
    #[serde(default = "default_lock_at_least_for_ms")]
    pub lock_at_least_for_ms: u64,
    #[serde(default = "default_lock_at_most_for_ms")]
    pub lock_at_most_for_ms: u64,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: i64,
    #[serde(default = "default_reap_finalized_after_ms")]
    pub reap_finalized_after_ms: u64,
    #[serde(default = "default_stale_pod_threshold_ms")]
    pub stale_pod_threshold_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            activation_tick_period_ms: default_activation_tick_period_ms(),
            lock_at_least_for_ms: default_lock_at_least_for_ms(),
            lock_at_most_for_ms: default_lock_at_most_for_ms(),
            claim_batch_size: default_claim_batch_size(),
            reap_finalized_after_ms: default_reap_finalized_after_ms(),
            stale_pod_threshold_ms: default_stale_pod_threshold_ms(),
        }
    }
}

fn default_activation_tick_period_ms() -> u64 {
    60_000
}
fn default_lock_at_least_for_ms() -> u64 {
    5_000
}
fn default_lock_at_most_for_ms() -> u64 {
    55_000
}
fn default_claim_batch_size() -> i64 {
    200
}
fn default_reap_finalized_after_ms() -> u64 {
    60 * 60 * 1000
}
fn default_stale_pod_threshold_ms() -> u64 {
    90_000
}

impl SchedulerConfig {
    /// Validates the lease ordering invariant:
    /// `lockAtLeastFor < lockAtMostFor < tick period`.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.lock_at_least_for_ms < self.lock_at_most_for_ms
            && self.lock_at_most_for_ms < self.activation_tick_period_ms)
        {
            return Err(format!(
                "scheduler lease ordering violated: lock_at_least_for_ms ({}) < lock_at_most_for_ms ({}) < activation_tick_period_ms ({}) must hold",
                self.lock_at_least_for_ms, self.lock_at_most_for_ms, self.activation_tick_period_ms
            ));
        }
        Ok(())
    }
}

/// Outbox publisher tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> i64 {
    100
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_default_satisfies_lease_ordering() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn scheduler_validate_rejects_bad_ordering() {
        let bad = SchedulerConfig {
            lock_at_least_for_ms: 60_000,
            lock_at_most_for_ms: 10_000,
            activation_tick_period_ms: 60_000,
            ..SchedulerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn targeting_config_defaults() {
        let cfg = TargetingConfig::default();
        assert_eq!(cfg.precompute_safety_buffer_ms, 120_000);
    }
}
