//! # SSE Connection Manager
//!
//! Owns in-memory push sinks for this pod's clients, registers/deregisters
//! connections in the cluster-wide presence store, emits heartbeats, and
//! tears down failing sinks. Styled after the broadcast-channel-per-connection
//! shape in the CasperLabs SSE server reference (`sse_server.rs`), adapted
//! from warp's filter/channel split to axum's
//! `Sse<impl Stream<Item = Result<Event, Infallible>>>` return type, and on
//! `dashmap::DashMap` for the concurrent connection table the same way
//! other in-process registries in this codebase use it.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use broadcast_shared::config::WorkerConfig;
use broadcast_shared::error::BroadcastResult;
use broadcast_shared::messaging::WorkerEvent;
use broadcast_shared::presence::PresenceStore;

/// The SSE event names this stream emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum SseEventBody {
    Connected {
        connection_id: String,
    },
    Heartbeat,
    Message {
        broadcast_id: i64,
        user_message_id: Option<i64>,
        content: String,
        priority: String,
        category: String,
        created_at: chrono::DateTime<Utc>,
        delivery_status: String,
        read_status: String,
    },
    MessageRemoved {
        broadcast_id: i64,
    },
    ReadReceipt {
        broadcast_id: i64,
        user_message_id: i64,
    },
    ConnectionLimitReached,
    ServerShutdown,
}

impl SseEventBody {
    fn event_name(&self) -> &'static str {
        match self {
            SseEventBody::Connected { .. } => "CONNECTED",
            SseEventBody::Heartbeat => "HEARTBEAT",
            SseEventBody::Message { .. } => "MESSAGE",
            SseEventBody::MessageRemoved { .. } => "MESSAGE_REMOVED",
            SseEventBody::ReadReceipt { .. } => "READ_RECEIPT",
            SseEventBody::ConnectionLimitReached => "CONNECTION_LIMIT_REACHED",
            SseEventBody::ServerShutdown => "SERVER_SHUTDOWN",
        }
    }

    /// `"{broadcastId}[:{userMessageId}]"` dedupe id; other event kinds
    /// carry no SSE id.
    fn sse_id(&self) -> Option<String> {
        match self {
            SseEventBody::Message {
                broadcast_id,
                user_message_id: Some(id),
                ..
            } => Some(format!("{broadcast_id}:{id}")),
            SseEventBody::Message { broadcast_id, .. } => Some(broadcast_id.to_string()),
            _ => None,
        }
    }

    fn into_axum_event(self) -> Event {
        let mut event = Event::default().event(self.event_name());
        if let Some(id) = self.sse_id() {
            event = event.id(id);
        }
        match serde_json::to_string(&self) {
            Ok(json) => event.data(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize SSE event body");
                event.data("{}")
            }
        }
    }
}

struct Sink {
    sender: mpsc::UnboundedSender<SseEventBody>,
    failures: AtomicU32,
}

/// Owns every local connection's sink for this pod. Keyed by connection id;
/// a user may hold several concurrent sinks (`maxConnectionsPerUser`
/// enforced in presence, not here).
pub struct SseConnectionManager {
    config: WorkerConfig,
    presence: PresenceStore,
    cluster: String,
    pod: String,
    sinks: Arc<DashMap<String, (String, Sink)>>,
}

pub enum ConnectOutcome {
    Stream(mpsc::UnboundedReceiver<SseEventBody>),
    LimitReached(mpsc::UnboundedReceiver<SseEventBody>),
}

impl SseConnectionManager {
    pub fn new(config: WorkerConfig, presence: PresenceStore, cluster: String, pod: String) -> Self {
        Self {
            config,
            presence,
            cluster,
            pod,
            sinks: Arc::new(DashMap::new()),
        }
    }

    /// Connect path: acquires the per-user lock, checks
    /// `maxConnectionsPerUser`, registers in presence, and opens a local
    /// sink. The connection-limit check is linearizable per user because
    /// the lock serializes concurrent connect attempts for the same user
    /// id.
    pub async fn connect(&self, user_id: &str, connection_id: &str) -> BroadcastResult<ConnectOutcome> {
        let lock_key = broadcast_shared::presence::PresenceKeys::connect_lock(user_id);
        let acquired = self
            .presence
            .try_acquire_lock(&lock_key, Duration::from_secs(5))
            .await?;
        if !acquired {
            // Another connect for this user is in flight; treat as a
            // transient limit hit rather than blocking this request.
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SseEventBody::ConnectionLimitReached);
            drop(tx);
            return Ok(ConnectOutcome::LimitReached(rx));
        }

        let existing = self.presence.connections_for_user(user_id).await?;
        if existing.len() >= self.config.sse.max_connections_per_user {
            self.presence.release_lock(&lock_key).await?;
            warn!(user_id, "SSE connection limit reached");
            let (tx, rx) = mpsc::unbounded_channel();
            // A stream that emits one CONNECTION_LIMIT_REACHED event and
            // closes, rather than refusing the connection outright.
            let _ = tx.send(SseEventBody::ConnectionLimitReached);
            drop(tx);
            return Ok(ConnectOutcome::LimitReached(rx));
        }

        self.presence
            .register_connection(user_id, connection_id, &self.pod, &self.cluster, Utc::now())
            .await?;
        self.presence.release_lock(&lock_key).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.insert(
            connection_id.to_string(),
            (
                user_id.to_string(),
                Sink {
                    sender: tx.clone(),
                    failures: AtomicU32::new(0),
                },
            ),
        );

        let _ = tx.send(SseEventBody::Connected {
            connection_id: connection_id.to_string(),
        });
        info!(user_id, connection_id, "SSE connection established");
        Ok(ConnectOutcome::Stream(rx))
    }

    /// Called when a client stream ends (disconnect, or a torn-down sink):
    /// removes the local sink and its presence entry.
    pub async fn disconnect(&self, connection_id: &str) -> BroadcastResult<()> {
        if let Some((_, (user_id, _))) = self.sinks.remove(connection_id) {
            self.presence
                .deregister_connection(&user_id, connection_id, &self.pod, &self.cluster)
                .await?;
        }
        Ok(())
    }

    /// Delivers a routed worker event to its target connection's local
    /// sink, translating the domain event into the SSE wire shape.
    pub fn push(&self, connection_id: &str, event: &WorkerEvent) {
        let body = match event {
            WorkerEvent::Message {
                broadcast_id,
                user_message_id,
                content,
                priority,
                category,
                created_at,
                delivery_status,
                read_status,
                ..
            } => SseEventBody::Message {
                broadcast_id: *broadcast_id,
                user_message_id: *user_message_id,
                content: content.clone(),
                priority: format!("{priority:?}").to_uppercase(),
                category: category.clone(),
                created_at: *created_at,
                delivery_status: delivery_status.clone(),
                read_status: read_status.clone(),
            },
            WorkerEvent::MessageRemoved { broadcast_id, .. } => {
                SseEventBody::MessageRemoved { broadcast_id: *broadcast_id }
            }
            WorkerEvent::ReadReceipt {
                broadcast_id,
                user_message_id,
                ..
            } => SseEventBody::ReadReceipt {
                broadcast_id: *broadcast_id,
                user_message_id: *user_message_id,
            },
        };
        self.emit(connection_id, body);
    }

    /// Pushes to every local sink belonging to a user (used when a
    /// `MESSAGE_REMOVED` group event reaches this pod for more than one of
    /// the user's connections).
    pub fn push_to_user(&self, user_id: &str, event: &WorkerEvent) {
        let targets: Vec<String> = self
            .sinks
            .iter()
            .filter(|entry| entry.value().0 == user_id)
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in targets {
            self.push(&connection_id, event);
        }
    }

    fn emit(&self, connection_id: &str, body: SseEventBody) {
        let Some(entry) = self.sinks.get(connection_id) else {
            return;
        };
        let (_, sink) = entry.value();
        if sink.sender.send(body).is_err() {
            sink.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            sink.failures.store(0, Ordering::Relaxed);
        }
    }

    /// Heartbeat tick: bulk-refreshes this pod's connection heartbeats in
    /// presence and emits `HEARTBEAT` to every local sink; a sink past
    /// `maxConsecutiveFailures` is torn down.
    pub async fn heartbeat_tick(&self) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut stale = Vec::new();

        for entry in self.sinks.iter() {
            let connection_id = entry.key().clone();
            let (user_id, sink) = entry.value();

            if sink.failures.load(Ordering::Relaxed) >= self.config.sse.max_consecutive_failures {
                stale.push(connection_id.clone());
                continue;
            }

            self.presence
                .touch_connection(user_id, &connection_id, &self.pod, &self.cluster, now)
                .await?;

            if sink.sender.send(SseEventBody::Heartbeat).is_err() {
                sink.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        for connection_id in stale {
            warn!(connection_id, "tearing down sink after repeated emit failures");
            self.disconnect(&connection_id).await?;
        }
        Ok(())
    }

    pub async fn pod_heartbeat_tick(&self) -> BroadcastResult<()> {
        self.presence
            .pod_self_heartbeat(&self.cluster, &self.pod, Utc::now())
            .await
    }

    /// `PreDestroy` shutdown hook: emits `SERVER_SHUTDOWN` to every local
    /// sink and deregisters each connection, so clients reconnect elsewhere
    /// instead of hanging on a dead stream.
    pub async fn shutdown(&self) {
        let connection_ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for connection_id in &connection_ids {
            if let Some(entry) = self.sinks.get(connection_id) {
                let _ = entry.value().1.sender.send(SseEventBody::ServerShutdown);
            }
        }
        tokio::time::sleep(Duration::from_millis(self.config.sse.shutdown_grace_ms)).await;
        for connection_id in connection_ids {
            if let Err(e) = self.disconnect(&connection_id).await {
                warn!(connection_id, error = %e, "failed to deregister connection during shutdown");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }
}

/// Adapts an `UnboundedReceiver<SseEventBody>` into the `Stream` axum's
/// `Sse` response wants, without pulling in a separate stream-adapter
/// crate.
pub fn into_event_stream(
    mut rx: mpsc::UnboundedReceiver<SseEventBody>,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(rx, move |mut rx| async move {
        let body = rx.recv().await?;
        Some((Ok(body.into_axum_event()), rx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_carries_broadcast_and_user_message_dedupe_id() {
        let body = SseEventBody::Message {
            broadcast_id: 42,
            user_message_id: Some(7),
            content: "hi".to_string(),
            priority: "NORMAL".to_string(),
            category: "general".to_string(),
            created_at: Utc::now(),
            delivery_status: "PENDING".to_string(),
            read_status: "UNREAD".to_string(),
        };
        assert_eq!(body.sse_id(), Some("42:7".to_string()));
        assert_eq!(body.event_name(), "MESSAGE");
    }

    #[test]
    fn all_broadcast_message_without_user_message_id_dedupes_by_broadcast_id() {
        let body = SseEventBody::Message {
            broadcast_id: 42,
            user_message_id: None,
            content: "hi".to_string(),
            priority: "NORMAL".to_string(),
            category: "general".to_string(),
            created_at: Utc::now(),
            delivery_status: "PENDING".to_string(),
            read_status: "UNREAD".to_string(),
        };
        assert_eq!(body.sse_id(), Some("42".to_string()));
    }

    #[test]
    fn heartbeat_and_connected_carry_no_dedupe_id() {
        assert_eq!(SseEventBody::Heartbeat.sse_id(), None);
        assert_eq!(
            SseEventBody::Connected { connection_id: "c1".to_string() }.sse_id(),
            None
        );
    }
}
