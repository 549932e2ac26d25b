//! # Presence Key Naming
//!
//! Centralizes the Redis key layout for every cache region the presence
//! store uses, so the store and any operational tooling agree on one
//! convention.

pub struct PresenceKeys;

impl PresenceKeys {
    /// Hash: connectionId -> ConnectionInfo JSON, per user.
    pub fn user_connections(user_id: &str) -> String {
        format!("presence:connections:{user_id}")
    }

    /// String: last-write-wins heartbeat timestamp (epoch millis) for a pod.
    pub fn pod_heartbeat(cluster: &str, pod: &str) -> String {
        format!("presence:pod_heartbeat:{cluster}:{pod}")
    }

    /// Set: connection ids currently owned by a pod.
    pub fn pod_owned_connections(cluster: &str, pod: &str) -> String {
        format!("presence:pod_connections:{cluster}:{pod}")
    }

    /// String: the owning user id for a connection id. A pod's owned-
    /// connection set (above) only has the bare connection id; this reverse
    /// index is what lets the stale-pod reaper find and remove the matching
    /// entry from `user_connections` instead of leaving it dangling forever.
    pub fn connection_owner(connection_id: &str) -> String {
        format!("presence:connection_owner:{connection_id}")
    }

    /// Set: all `{cluster}:{pod}` identities that have ever heartbeated,
    /// consulted by the stale-pod reaper to find candidates cheaply instead
    /// of scanning the full keyspace.
    pub fn known_pods() -> &'static str {
        "presence:known_pods"
    }

    /// Set: user ids with at least one live connection anywhere in the
    /// cluster, maintained alongside `user_connections` so the
    /// orchestration consumer can enumerate "all online users" for ALL
    /// broadcasts without a full-keyspace scan.
    pub fn online_users() -> &'static str {
        "presence:online_users"
    }

    /// String: frozen broadcast body, the BroadcastContent cache.
    pub fn broadcast_content(broadcast_id: i64) -> String {
        format!("cache:broadcast_content:{broadcast_id}")
    }

    /// List: ordered inbox items for a user, the UserInbox cache.
    pub fn user_inbox(user_id: &str) -> String {
        format!("cache:user_inbox:{user_id}")
    }

    /// List: events queued while a user was offline, the PendingEvents
    /// cache.
    pub fn pending_events(user_id: &str) -> String {
        format!("cache:pending_events:{user_id}")
    }

    /// Per-user distributed lock guarding the connection-limit check.
    pub fn connect_lock(user_id: &str) -> String {
        format!("lock:connect:{user_id}")
    }

    /// Cluster-wide singleton lock for a named scheduler job.
    pub fn scheduler_lock(job_name: &str) -> String {
        format!("lock:scheduler:{job_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_stable() {
        assert_eq!(
            PresenceKeys::user_connections("u1"),
            "presence:connections:u1"
        );
        assert_eq!(
            PresenceKeys::pod_heartbeat("us-east", "pod-1"),
            "presence:pod_heartbeat:us-east:pod-1"
        );
        assert_eq!(
            PresenceKeys::scheduler_lock("activate_ready"),
            "lock:scheduler:activate_ready"
        );
        assert_eq!(PresenceKeys::online_users(), "presence:online_users");
    }
}
