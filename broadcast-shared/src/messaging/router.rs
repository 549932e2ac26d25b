//! # Topic Router
//!
//! Queue/topic name routing abstraction: one orchestration topic, and a
//! per-pod worker topic named `{cluster}-{pod}`, each with a `.DLT`
//! sibling.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopicNameError {
    #[error("invalid topic name component: {0}")]
    Invalid(&'static str),
}

/// Naming convention trait, separated from the queue transport so a
/// deployment can rename topics without touching consumer logic.
pub trait TopicRouter: Send + Sync {
    fn orchestration_topic(&self) -> String;
    fn worker_topic(&self, cluster: &str, pod: &str) -> String;
    fn dlt_topic(&self, topic: &str) -> String;
    /// Reverse of `worker_topic`: recover `(cluster, pod)` from a worker
    /// topic name, or `None` if it doesn't match the expected pattern.
    fn extract_cluster_pod(&self, topic: &str) -> Option<(String, String)>;
}

#[derive(Debug, Clone)]
pub struct DefaultTopicRouter {
    orchestration_topic: String,
    worker_topic_prefix: String,
}

impl DefaultTopicRouter {
    pub fn new(orchestration_topic: impl Into<String>, worker_topic_prefix: impl Into<String>) -> Self {
        Self {
            orchestration_topic: orchestration_topic.into(),
            worker_topic_prefix: worker_topic_prefix.into(),
        }
    }
}

impl Default for DefaultTopicRouter {
    fn default() -> Self {
        Self {
            orchestration_topic: "broadcast_orchestration".to_string(),
            worker_topic_prefix: "broadcast_worker".to_string(),
        }
    }
}

impl TopicRouter for DefaultTopicRouter {
    fn orchestration_topic(&self) -> String {
        self.orchestration_topic.clone()
    }

    fn worker_topic(&self, cluster: &str, pod: &str) -> String {
        format!("{}_{}-{}", self.worker_topic_prefix, cluster, pod)
    }

    fn dlt_topic(&self, topic: &str) -> String {
        format!("{topic}.DLT")
    }

    fn extract_cluster_pod(&self, topic: &str) -> Option<(String, String)> {
        let rest = topic.strip_prefix(&format!("{}_", self.worker_topic_prefix))?;
        let (cluster, pod) = rest.split_once('-')?;
        Some((cluster.to_string(), pod.to_string()))
    }
}

/// Enum dispatch for `TopicRouter`.
///
/// Uses enum dispatch instead of `Arc<dyn TopicRouter>` for zero-cost
/// dispatch and to keep the pattern uniform with `MessageRouterKind` in the
/// corpus this system's messaging layer is styled after.
#[derive(Debug, Clone)]
pub enum TopicRouterKind {
    Default(DefaultTopicRouter),
}

impl Default for TopicRouterKind {
    fn default() -> Self {
        Self::Default(DefaultTopicRouter::default())
    }
}

impl TopicRouterKind {
    pub fn orchestration_topic(&self) -> String {
        match self {
            Self::Default(r) => r.orchestration_topic(),
        }
    }

    pub fn worker_topic(&self, cluster: &str, pod: &str) -> String {
        match self {
            Self::Default(r) => r.worker_topic(cluster, pod),
        }
    }

    pub fn dlt_topic(&self, topic: &str) -> String {
        match self {
            Self::Default(r) => r.dlt_topic(topic),
        }
    }

    pub fn extract_cluster_pod(&self, topic: &str) -> Option<(String, String)> {
        match self {
            Self::Default(r) => r.extract_cluster_pod(topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_topic_follows_cluster_pod_convention() {
        let router = DefaultTopicRouter::default();
        assert_eq!(
            router.worker_topic("us-east", "pod-7"),
            "broadcast_worker_us-east-pod-7"
        );
    }

    #[test]
    fn dlt_topic_appends_suffix() {
        let router = DefaultTopicRouter::default();
        assert_eq!(
            router.dlt_topic("broadcast_orchestration"),
            "broadcast_orchestration.DLT"
        );
    }

    #[test]
    fn extract_cluster_pod_reverses_worker_topic() {
        let router = DefaultTopicRouter::default();
        let topic = router.worker_topic("us-east", "pod-7");
        assert_eq!(
            router.extract_cluster_pod(&topic),
            Some(("us-east".to_string(), "pod-7".to_string()))
        );
        assert_eq!(router.extract_cluster_pod("broadcast_orchestration"), None);
    }

    #[test]
    fn kind_delegates_to_default() {
        let kind = TopicRouterKind::default();
        assert_eq!(kind.orchestration_topic(), "broadcast_orchestration");
    }
}
