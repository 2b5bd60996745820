//! HTTP surface for the discovery API.
//!
//! JSON over HTTP, one route per operation. All responses use the shared
//! envelope `{ errorCode, errorMessage, data }` where `errorCode = -1`
//! denotes success; failures carry the taxonomy code and an HTTP status
//! from the error class.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use warden_proto::{ServiceKind, codes};

use crate::{
    DecommissionRequest, Discovery, DiscoveryError, RegisterRequest, RotateRequest, UpdateRequest,
};

pub type AppState = Arc<Discovery>;

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    #[serde(rename = "errorCode")]
    pub error_code: i64,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            error_code: codes::SUCCESS,
            error_message: None,
            data: Some(data),
        }
    }
}

/// Wrapper so handlers can `?` a [`DiscoveryError`] straight into a response.
pub struct ApiError(pub DiscoveryError);

impl From<DiscoveryError> for ApiError {
    fn from(e: DiscoveryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Envelope::<()> {
            error_code: self.0.error_code(),
            error_message: Some(self.0.to_string()),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn parse_kind(raw: &str) -> Result<ServiceKind, ApiError> {
    ServiceKind::parse(raw).ok_or_else(|| {
        ApiError(DiscoveryError::InvalidFieldValue {
            field: "kind",
            reason: format!("unknown service kind: {raw}"),
        })
    })
}

fn admin_token_header(headers: &HeaderMap) -> String {
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ─── Query parameters ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DiscoverParams {
    min_version: Option<String>,
    #[serde(default)]
    only_healthy: bool,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_deleted: bool,
    #[serde(default)]
    include_decommissioned: bool,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

const DEFAULT_LOG_LIMIT: usize = 50;

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<crate::RegisterResponse> {
    Ok(Json(Envelope::ok(state.register(req).await?)))
}

async fn discover(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<DiscoverParams>,
) -> ApiResult<Vec<warden_proto::Endpoint>> {
    let kind = parse_kind(&kind)?;
    let endpoints = state
        .discover(kind, params.min_version.as_deref(), params.only_healthy)
        .await?;
    Ok(Json(Envelope::ok(endpoints)))
}

async fn active(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Option<warden_proto::Endpoint>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(Envelope::ok(state.active_endpoint(kind).await?)))
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<warden_proto::Endpoint>> {
    let token = admin_token_header(&headers);
    let endpoints = state
        .list(params.include_deleted, params.include_decommissioned, &token)
        .await?;
    Ok(Json(Envelope::ok(endpoints)))
}

async fn health_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<crate::HealthHistory> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(Envelope::ok(state.health_history(&id, limit).await?)))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<warden_proto::Endpoint> {
    Ok(Json(Envelope::ok(state.update(&id, req).await?)))
}

async fn decommission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DecommissionRequest>,
) -> ApiResult<warden_proto::Endpoint> {
    Ok(Json(Envelope::ok(
        state.decommission(&id, &req.reason, &req.admin_token).await?,
    )))
}

async fn rotate(
    State(state): State<AppState>,
    Json(req): Json<RotateRequest>,
) -> ApiResult<crate::RotateResponse> {
    Ok(Json(Envelope::ok(state.rotate(req).await?)))
}

async fn failover_log(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<warden_proto::FailoverEvent>> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(Envelope::ok(state.failover_log(&group, limit).await?)))
}

async fn rotation_log(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<warden_proto::RotationAudit>> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(Envelope::ok(state.rotation_log(limit).await?)))
}

async fn healthz() -> Json<Envelope<serde_json::Value>> {
    Json(Envelope::ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn create_router(discovery: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/endpoints", post(register).get(list))
        .route("/v1/endpoints/:id", patch(update))
        .route("/v1/endpoints/:id/health", get(health_history))
        .route("/v1/endpoints/:id/decommission", post(decommission))
        .route("/v1/discovery/:kind", get(discover))
        .route("/v1/active/:kind", get(active))
        .route("/v1/groups/:group/events", get(failover_log))
        .route("/v1/rotations", post(rotate).get(rotation_log))
        .layer(TraceLayer::new_for_http())
        .with_state(discovery)
}
