//! # Worker (Pod) Configuration
//!
//! SSE connection manager and HTTP surface settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub sse: SseConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            sse: SseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_worker_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_worker_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_worker_port() -> u16 {
    3001
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SseConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_client_timeout_threshold_ms")]
    pub client_timeout_threshold_ms: u64,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_pod_heartbeat_interval_ms")]
    pub pod_heartbeat_interval_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            client_timeout_threshold_ms: default_client_timeout_threshold_ms(),
            max_connections_per_user: default_max_connections_per_user(),
            pod_heartbeat_interval_ms: default_pod_heartbeat_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_client_timeout_threshold_ms() -> u64 {
    45_000
}
fn default_max_connections_per_user() -> usize {
    5
}
fn default_pod_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_shutdown_grace_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_defaults_match_spec() {
        let cfg = SseConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 15_000);
        assert_eq!(cfg.pod_heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.max_consecutive_failures, 3);
        assert_eq!(cfg.shutdown_grace_ms, 500);
    }
}
