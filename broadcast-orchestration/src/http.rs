//! # Admin HTTP Surface
//!
//! Minimal HTTP admin surface: broadcast CRUD-lite plus the DLT operator
//! endpoints, built on plain `axum` with a `tower-http` trace/CORS layer
//! stack. Request validation/auth stay out of scope here, so handlers do
//! the minimum structural parsing needed to call the domain services,
//! nothing more.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use broadcast_queue::PgQueue;
use broadcast_shared::error::BroadcastError;
use broadcast_shared::models::{Broadcast, DltRecord, PerUserMessage, Priority, TargetType};

use crate::dlq::DlqService;
use crate::lifecycle::{CreateBroadcastRequest, LifecycleService, RoleResolver};

#[derive(Clone)]
pub struct AppState<R: RoleResolver + 'static> {
    pub pool: PgPool,
    pub queue: PgQueue,
    pub lifecycle: Arc<LifecycleService<R>>,
    pub dlq: Arc<DlqService>,
}

pub fn router<R: RoleResolver + 'static>(state: AppState<R>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<R>))
        .route("/broadcasts", post(create_broadcast::<R>).get(list_broadcasts::<R>))
        .route("/broadcasts/scheduled", get(list_scheduled::<R>))
        .route("/broadcasts/active", get(list_active::<R>))
        .route("/broadcasts/:id", get(get_broadcast::<R>))
        .route("/broadcasts/:id/cancel", post(cancel_broadcast::<R>))
        .route("/broadcasts/:id/deliveries", get(list_deliveries::<R>))
        .route("/dlt", get(list_dlt::<R>).delete(purge_all_dlt::<R>))
        .route("/dlt/:id", delete(purge_one_dlt::<R>))
        .route("/dlt/:id/redrive", post(redrive_one::<R>))
        .route("/dlt/redrive-all", post(redrive_all::<R>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz<R: RoleResolver + 'static>(State(state): State<AppState<R>>) -> impl IntoResponse {
    let report = crate::health::evaluate_readiness(&state.pool, &state.queue).await;
    let status = if report.is_ready() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
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

/// `POST /broadcasts` request body. Fields mirror [`CreateBroadcastRequest`]
/// directly; `targetType`/`priority` deserialize via the same `UPPERCASE`
/// enum representation the domain models use.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBroadcastBody {
    sender_id: i64,
    sender_display_name: String,
    content: String,
    target_type: TargetType,
    #[serde(default)]
    target_ids: Vec<String>,
    #[serde(default = "default_priority")]
    priority: Priority,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    fire_and_forget: bool,
}

fn default_priority() -> Priority {
    Priority::Normal
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBroadcastResponse {
    id: i64,
    status: String,
    total_targeted: Option<i64>,
}

async fn create_broadcast<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Json(body): Json<CreateBroadcastBody>,
) -> Result<(StatusCode, Json<CreateBroadcastResponse>), BroadcastError> {
    let request = CreateBroadcastRequest {
        sender_id: body.sender_id,
        sender_display_name: body.sender_display_name,
        content: body.content,
        target_type: body.target_type,
        target_ids: body.target_ids,
        priority: body.priority,
        category: body.category,
        scheduled_at: body.scheduled_at,
        expires_at: body.expires_at,
        fire_and_forget: body.fire_and_forget,
    };
    let result = state.lifecycle.create_broadcast(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateBroadcastResponse {
            id: result.id,
            status: format!("{:?}", result.status).to_uppercase(),
            total_targeted: result.total_targeted,
        }),
    ))
}

async fn cancel_broadcast<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, BroadcastError> {
    state.lifecycle.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_broadcast<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(id): Path<i64>,
) -> Result<Json<Broadcast>, BroadcastError> {
    let row: Broadcast = sqlx::query_as("SELECT * FROM broadcasts WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| BroadcastError::ResourceNotFound(format!("broadcast {id}")))?;
    Ok(Json(row))
}

async fn list_broadcasts<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<Vec<Broadcast>>, BroadcastError> {
    let rows: Vec<Broadcast> = sqlx::query_as("SELECT * FROM broadcasts ORDER BY created_at DESC LIMIT 500")
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(rows))
}

async fn list_scheduled<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<Vec<Broadcast>>, BroadcastError> {
    let rows: Vec<Broadcast> = sqlx::query_as(
        "SELECT * FROM broadcasts WHERE status = 'SCHEDULED' ORDER BY scheduled_at LIMIT 500",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn list_active<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<Vec<Broadcast>>, BroadcastError> {
    let rows: Vec<Broadcast> = sqlx::query_as(
        "SELECT * FROM broadcasts WHERE status = 'ACTIVE' ORDER BY created_at DESC LIMIT 500",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn list_deliveries<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PerUserMessage>>, BroadcastError> {
    let rows: Vec<PerUserMessage> = sqlx::query_as(
        "SELECT * FROM user_broadcast_messages WHERE broadcast_id = $1 ORDER BY id",
    )
    .bind(id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn list_dlt<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<Vec<DltRecord>>, BroadcastError> {
    Ok(Json(state.dlq.list().await?))
}

async fn redrive_one<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, BroadcastError> {
    state.dlq.redrive(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedriveFailure {
    id: Uuid,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedriveAllResponse {
    total: usize,
    success_count: usize,
    failure_count: usize,
    failures: Vec<RedriveFailure>,
}

async fn redrive_all<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<Json<RedriveAllResponse>, BroadcastError> {
    let outcome = state.dlq.redrive_all().await?;
    Ok(Json(RedriveAllResponse {
        total: outcome.total,
        success_count: outcome.success_count,
        failure_count: outcome.failure_count,
        failures: outcome
            .failures
            .into_iter()
            .map(|(id, error)| RedriveFailure { id, error })
            .collect(),
    }))
}

async fn purge_one_dlt<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, BroadcastError> {
    state.dlq.purge(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn purge_all_dlt<R: RoleResolver + 'static>(
    State(state): State<AppState<R>>,
) -> Result<StatusCode, BroadcastError> {
    state.dlq.purge_all().await?;
    Ok(StatusCode::NO_CONTENT)
}
