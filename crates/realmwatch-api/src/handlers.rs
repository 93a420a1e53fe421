//! REST API handlers.
//!
//! Each handler calls one `Scheduler` operation and returns JSON responses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use realm_core::RealmConfig;
use realmwatch_scheduler::{ConfigError, SchedulerError, StoreCallError};
use realmwatch_state::StatusRecord;

use crate::ApiState;

/// Default page size of `/history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
/// Largest page size `/history` will return.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }

    fn ok(data: T) -> Json<Self> {
        Json(Self::success(data))
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(ApiResponse::<()>::failure(msg)))
}

/// Map a control-surface error to its HTTP status.
fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::Config(ConfigError::NotFound(_)) | SchedulerError::NoStatus(_) => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::Config(ConfigError::DuplicateTarget(_)) | SchedulerError::InFlight(_) => {
            StatusCode::CONFLICT
        }
        SchedulerError::Config(ConfigError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
        SchedulerError::Cycle { .. } => StatusCode::BAD_GATEWAY,
        SchedulerError::Store(StoreCallError::Timeout(_)) => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Store(StoreCallError::State(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, status = status.as_u16(), "request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

// ── Realms ─────────────────────────────────────────────────────

/// GET /api/v1/realms
pub async fn list_realms(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_realms().await)
}

/// POST /api/v1/realms
pub async fn add_realm(
    State(state): State<ApiState>,
    Json(config): Json<RealmConfig>,
) -> impl IntoResponse {
    match state.scheduler.add_realm(config).await {
        Ok(config) => (StatusCode::CREATED, ApiResponse::ok(config)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/realms/:principal
pub async fn get_realm(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.get_realm(&principal).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Fields of a realm that can be changed after registration. Omitted
/// fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateRealmRequest {
    pub url: Option<String>,
    #[serde(alias = "name")]
    pub display_name: Option<String>,
    pub enabled: Option<bool>,
    /// `null` clears the override so the scheduler-wide interval applies.
    #[serde(default, deserialize_with = "present")]
    pub interval_secs: Option<Option<u64>>,
}

/// Maps a present field, `null` included, to `Some`; absent fields fall
/// back to `None` through `#[serde(default)]`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// PUT /api/v1/realms/:principal
pub async fn update_realm(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
    Json(req): Json<UpdateRealmRequest>,
) -> impl IntoResponse {
    let mut config = match state.scheduler.get_realm(&principal).await {
        Ok(config) => config,
        Err(e) => return scheduler_error(e),
    };
    if let Some(url) = req.url {
        config.url = url;
    }
    if let Some(name) = req.display_name {
        config.display_name = name;
    }
    if let Some(enabled) = req.enabled {
        config.enabled = enabled;
    }
    if let Some(interval_secs) = req.interval_secs {
        config.interval_secs = interval_secs;
    }

    match state.scheduler.update_realm(config).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/realms/:principal
pub async fn remove_realm(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.remove_realm(&principal).await {
        Ok(_) => ApiResponse::ok("deleted").into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/realms/:principal/enable
pub async fn enable_realm(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.set_enabled(&principal, true).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/realms/:principal/disable
pub async fn disable_realm(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.set_enabled(&principal, false).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Status records ─────────────────────────────────────────────

/// GET /api/v1/realms/:principal/status
///
/// `latest` is null until the first successful fetch; `last_error` still
/// explains why.
pub async fn realm_status(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.realm_status(&principal).await {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/realms/:principal/latest
pub async fn latest(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.latest(&principal).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    /// Only records strictly older than this Unix millisecond timestamp.
    pub before: Option<u64>,
}

/// GET /api/v1/realms/:principal/history
pub async fn history(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    match state.scheduler.history(&principal, limit, query.before).await {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Fetching ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct FetchQuery {
    pub network: Option<String>,
}

/// POST /api/v1/realms/:principal/fetch
pub async fn fetch(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
    Query(query): Query<FetchQuery>,
) -> impl IntoResponse {
    match state
        .scheduler
        .fetch(&principal, query.network.as_deref())
        .await
    {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/realms/:principal/fetch-now
pub async fn fetch_now(
    State(state): State<ApiState>,
    Path(principal): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.fetch_now(&principal).await {
        Ok(queued) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "principal": principal,
                "queued": queued,
            })),
        )
            .into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchFetchRequest {
    pub principals: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
}

/// POST /api/v1/batch-fetch
pub async fn batch_fetch(
    State(state): State<ApiState>,
    Json(req): Json<BatchFetchRequest>,
) -> impl IntoResponse {
    if req.principals.is_empty() {
        return error_response("principals must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }

    let results = state
        .scheduler
        .batch_fetch(&req.principals, req.network.as_deref())
        .await;
    let body: BTreeMap<String, ApiResponse<StatusRecord>> = results
        .into_iter()
        .map(|(principal, result)| {
            let item = match result {
                Ok(record) => ApiResponse::success(record),
                Err(e) => ApiResponse::failure(e.to_string()),
            };
            (principal, item)
        })
        .collect();
    ApiResponse::ok(body).into_response()
}

/// GET /api/v1/summary
pub async fn summary(State(state): State<ApiState>) -> impl IntoResponse {
    match state.scheduler.summary().await {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Scheduler ──────────────────────────────────────────────────

/// GET /api/v1/scheduler
pub async fn scheduler_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.status().await)
}

/// POST /api/v1/scheduler/start
pub async fn start_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.start();
    ApiResponse::ok(state.scheduler.status().await)
}

/// POST /api/v1/scheduler/stop
pub async fn stop_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.stop();
    ApiResponse::ok(state.scheduler.status().await)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
