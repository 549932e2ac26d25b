//! # Worker HTTP Surface
//!
//! The HTTP surface exposed by a worker pod: the SSE stream endpoint plus
//! the inbox read surface. Styled after `broadcast_orchestration::http`'s
//! axum `Router`/`AppState`/`IntoResponse for BroadcastError` pattern, reused
//! here verbatim since both crates serve the same admin-style minimal HTTP
//! surface, with auth/validation left to a fronting gateway.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use broadcast_queue::PgQueue;
use broadcast_shared::error::BroadcastError;

use crate::inbox::{InboxItem, InboxService};
use crate::sse::{into_event_stream, ConnectOutcome, SseConnectionManager};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: PgQueue,
    pub sse: Arc<SseConnectionManager>,
    pub inbox: Arc<InboxService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sse", get(connect_sse))
        .route("/inbox", get(get_inbox))
        .route("/inbox/:broadcast_id/read", post(mark_read))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let report = evaluate_readiness(&state.pool, &state.queue).await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    ready: bool,
    database_connected: bool,
    queue_connected: bool,
}

async fn evaluate_readiness(pool: &PgPool, queue: &PgQueue) -> ReadinessBody {
    let database_connected = sqlx::query("SELECT 1").execute(pool).await.is_ok();
    let queue_connected = queue.health_check().await.connected;
    ReadinessBody {
        ready: database_connected && queue_connected,
        database_connected,
        queue_connected,
    }
}

impl IntoResponse for BroadcastError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "connectionId")]
    connection_id: String,
}

/// `GET /sse?userId=&connectionId=`: opens the long-lived event stream for
/// one connection. A connection-limit hit still opens the stream, but it
/// carries a single `CONNECTION_LIMIT_REACHED` event before closing.
async fn connect_sse(
    State(state): State<AppState>,
    Query(query): Query<SseQuery>,
) -> Result<Response, BroadcastError> {
    match state.sse.connect(&query.user_id, &query.connection_id).await? {
        ConnectOutcome::Stream(rx) => {
            let stream = into_event_stream(rx);
            Ok(Sse::new(stream)
                .keep_alive(axum::response::sse::KeepAlive::default())
                .into_response())
        }
        ConnectOutcome::LimitReached(rx) => {
            let stream = into_event_stream(rx);
            Ok(Sse::new(stream).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboxQuery {
    #[serde(rename = "userId")]
    user_id: String,
}

/// `GET /inbox?userId=`: assembles (or returns the already-cached view of)
/// a user's inbox.
async fn get_inbox(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Vec<InboxItem>>, BroadcastError> {
    if let Some(cached) = state.inbox.cached(&query.user_id).await? {
        return Ok(Json(cached));
    }
    Ok(Json(state.inbox.assemble(&query.user_id).await?))
}

#[derive(Debug, Deserialize)]
struct MarkReadQuery {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    user_message_id: i64,
}

/// `POST /inbox/{broadcastId}/read?userId=`: marks one broadcast read for a user.
async fn mark_read(
    State(state): State<AppState>,
    Path(broadcast_id): Path<i64>,
    Query(query): Query<MarkReadQuery>,
) -> Result<Json<MarkReadResponse>, BroadcastError> {
    let user_message_id = state.inbox.mark_read(broadcast_id, &query.user_id).await?;
    Ok(Json(MarkReadResponse { user_message_id }))
}
