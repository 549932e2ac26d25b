//! # Common Configuration
//!
//! Settings shared by orchestration and worker pods: identity, database,
//! cache, and the event bus topic names.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_pod_name")]
    pub pod_name: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            pod_name: default_pod_name(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            topics: TopicsConfig::default(),
        }
    }
}

fn default_cluster_name() -> String {
    "local".to_string()
}

fn default_pod_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "pod-0".to_string())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/broadcast".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Event bus topic names: one orchestration topic, and a per-pod worker
/// topic prefix combined with `{cluster}-{pod}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    #[serde(default = "default_orchestration_topic")]
    pub orchestration_topic: String,
    #[serde(default = "default_worker_topic_prefix")]
    pub worker_topic_prefix: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            orchestration_topic: default_orchestration_topic(),
            worker_topic_prefix: default_worker_topic_prefix(),
        }
    }
}

fn default_orchestration_topic() -> String {
    "broadcast_orchestration".to_string()
}

fn default_worker_topic_prefix() -> String {
    "broadcast_worker".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topics_match_naming_convention() {
        let topics = TopicsConfig::default();
        assert_eq!(topics.orchestration_topic, "broadcast_orchestration");
        assert_eq!(topics.worker_topic_prefix, "broadcast_worker");
    }
}
