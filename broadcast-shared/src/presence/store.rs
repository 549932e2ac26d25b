//! # Presence Store Implementation
//!
//! Redis-backed, using the `redis` crate's tokio-comp + connection-manager
//! features for its intended purpose: a cluster-wide key/value store for
//! presence and cache regions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::BroadcastResult;

use super::keys::PresenceKeys;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub pod_name: String,
    pub cluster_name: String,
    pub last_heartbeat_epoch_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PodHeartbeat {
    pub cluster: String,
    pub pod: String,
    pub last_heartbeat_epoch_ms: i64,
}

/// Cluster-wide presence/cache facade. Cloning is cheap: `ConnectionManager`
/// is itself an `Arc`-backed handle that reconnects transparently.
#[derive(Debug, Clone)]
pub struct PresenceStore {
    conn: ConnectionManager,
}

impl PresenceStore {
    pub async fn connect(redis_url: &str) -> BroadcastResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    // ---- Connection registry ----

    /// Registers `(userId, connectionId, pod, cluster)`. Returns the number
    /// of connections this user now has, for the connect-path's
    /// `maxConnectionsPerUser` check; the caller is expected to hold
    /// `PresenceKeys::connect_lock(user_id)` while calling this so the
    /// check-then-register sequence is linearizable.
    pub async fn register_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        pod: &str,
        cluster: &str,
        now: DateTime<Utc>,
    ) -> BroadcastResult<usize> {
        let mut conn = self.conn.clone();
        let info = ConnectionInfo {
            pod_name: pod.to_string(),
            cluster_name: cluster.to_string(),
            last_heartbeat_epoch_ms: now.timestamp_millis(),
        };
        let payload = serde_json::to_string(&info)?;

        let _: () = conn
            .hset(PresenceKeys::user_connections(user_id), connection_id, payload)
            .await?;
        let _: () = conn
            .sadd(PresenceKeys::pod_owned_connections(cluster, pod), connection_id)
            .await?;
        let _: () = conn.sadd(PresenceKeys::online_users(), user_id).await?;
        let _: () = conn
            .set(PresenceKeys::connection_owner(connection_id), user_id)
            .await?;

        let count: usize = conn.hlen(PresenceKeys::user_connections(user_id)).await?;
        Ok(count)
    }

    pub async fn deregister_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        pod: &str,
        cluster: &str,
    ) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(PresenceKeys::user_connections(user_id), connection_id)
            .await?;
        let _: () = conn
            .srem(PresenceKeys::pod_owned_connections(cluster, pod), connection_id)
            .await?;
        let _: () = conn.del(PresenceKeys::connection_owner(connection_id)).await?;

        let remaining: usize = conn.hlen(PresenceKeys::user_connections(user_id)).await?;
        if remaining == 0 {
            let _: () = conn.srem(PresenceKeys::online_users(), user_id).await?;
        }
        Ok(())
    }

    /// All user ids with at least one live connection anywhere in the
    /// cluster — the target set for an ALL broadcast.
    pub async fn online_users(&self) -> BroadcastResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = conn.smembers(PresenceKeys::online_users()).await?;
        Ok(users)
    }

    /// All of a user's live connections. The orchestration consumer picks
    /// the most recent one.
    pub async fn connections_for_user(
        &self,
        user_id: &str,
    ) -> BroadcastResult<HashMap<String, ConnectionInfo>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> =
            conn.hgetall(PresenceKeys::user_connections(user_id)).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for (connection_id, payload) in raw {
            out.insert(connection_id, serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    /// Refresh one connection's heartbeat timestamp inside its user's hash
    /// entry. The SSE manager calls this once per local sink on each
    /// heartbeat tick since only it knows the userId <-> connectionId
    /// mapping for its own connections; the pod heartbeat key itself is
    /// refreshed separately via `pod_self_heartbeat`.
    pub async fn touch_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        pod: &str,
        cluster: &str,
        now: DateTime<Utc>,
    ) -> BroadcastResult<()> {
        self.register_connection(user_id, connection_id, pod, cluster, now)
            .await?;
        Ok(())
    }

    // ---- Pod heartbeat / stale-pod reaping ----

    pub async fn pod_self_heartbeat(
        &self,
        cluster: &str,
        pod: &str,
        now: DateTime<Utc>,
    ) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(PresenceKeys::pod_heartbeat(cluster, pod), now.timestamp_millis())
            .await?;
        let _: () = conn
            .sadd(PresenceKeys::known_pods(), format!("{cluster}:{pod}"))
            .await?;
        Ok(())
    }

    /// Finds pods missing a heartbeat for at least `stale_threshold`, and
    /// for each, removes its owned connection ids and their presence
    /// entries. Returns the reaped `(cluster, pod)` identities.
    pub async fn reap_stale_pods(
        &self,
        now: DateTime<Utc>,
        stale_threshold: Duration,
    ) -> BroadcastResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let known: Vec<String> = conn.smembers(PresenceKeys::known_pods()).await?;
        let mut reaped = Vec::new();

        for identity in known {
            let Some((cluster, pod)) = identity.split_once(':') else {
                continue;
            };
            let heartbeat: Option<i64> = conn.get(PresenceKeys::pod_heartbeat(cluster, pod)).await?;
            let is_stale = match heartbeat {
                Some(ts) => {
                    now.timestamp_millis() - ts >= stale_threshold.as_millis() as i64
                }
                None => true,
            };

            if !is_stale {
                continue;
            }

            let connection_ids: Vec<String> = conn
                .smembers(PresenceKeys::pod_owned_connections(cluster, pod))
                .await?;

            for connection_id in &connection_ids {
                let owner: Option<String> =
                    conn.get(PresenceKeys::connection_owner(connection_id)).await?;
                if let Some(user_id) = owner {
                    let _: () = conn
                        .hdel(PresenceKeys::user_connections(&user_id), connection_id)
                        .await?;
                    let remaining: usize =
                        conn.hlen(PresenceKeys::user_connections(&user_id)).await?;
                    if remaining == 0 {
                        let _: () = conn.srem(PresenceKeys::online_users(), &user_id).await?;
                    }
                }
                let _: () = conn.del(PresenceKeys::connection_owner(connection_id)).await?;
            }

            let _: () = conn
                .del(PresenceKeys::pod_owned_connections(cluster, pod))
                .await?;
            let _: () = conn.del(PresenceKeys::pod_heartbeat(cluster, pod)).await?;
            let _: () = conn.srem(PresenceKeys::known_pods(), &identity).await?;

            reaped.push((cluster.to_string(), pod.to_string()));
        }

        Ok(reaped)
    }

    // ---- Content / inbox / pending-events caches ----

    pub async fn cache_broadcast_content(
        &self,
        broadcast_id: i64,
        content: &serde_json::Value,
    ) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(content)?;
        let _: () = conn
            .set(PresenceKeys::broadcast_content(broadcast_id), payload)
            .await?;
        Ok(())
    }

    pub async fn get_broadcast_content(
        &self,
        broadcast_id: i64,
    ) -> BroadcastResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> =
            conn.get(PresenceKeys::broadcast_content(broadcast_id)).await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    pub async fn evict_broadcast_content(&self, broadcast_id: i64) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(PresenceKeys::broadcast_content(broadcast_id)).await?;
        Ok(())
    }

    pub async fn evict_user_inbox(&self, user_id: &str) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(PresenceKeys::user_inbox(user_id)).await?;
        Ok(())
    }

    /// Caches the assembled inbox list. Stored as a single JSON blob rather
    /// than a Redis list since the assembled order is already final and the
    /// whole view is always read back together.
    pub async fn cache_user_inbox(
        &self,
        user_id: &str,
        items: &serde_json::Value,
    ) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(items)?;
        let _: () = conn.set(PresenceKeys::user_inbox(user_id), payload).await?;
        Ok(())
    }

    pub async fn get_user_inbox(&self, user_id: &str) -> BroadcastResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(PresenceKeys::user_inbox(user_id)).await?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    pub async fn append_pending_event(
        &self,
        user_id: &str,
        event: &serde_json::Value,
    ) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.rpush(PresenceKeys::pending_events(user_id), payload).await?;
        Ok(())
    }

    /// Atomically drains and returns all pending events for a user, so a
    /// concurrent append during assembly is never lost or
    /// double-delivered.
    pub async fn drain_pending_events(
        &self,
        user_id: &str,
    ) -> BroadcastResult<Vec<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let key = PresenceKeys::pending_events(user_id);
        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await?;
        raw.into_iter()
            .map(|s| serde_json::from_str(&s).map_err(Into::into))
            .collect()
    }

    // ---- Distributed locks (scheduler lock, connect lock) ----

    /// `SET key value NX PX ttl_ms`. Returns true if the lock was acquired.
    pub async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> BroadcastResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_lock(&self, key: &str) -> BroadcastResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_round_trips_through_json() {
        let info = ConnectionInfo {
            pod_name: "pod-1".to_string(),
            cluster_name: "us-east".to_string(),
            last_heartbeat_epoch_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
