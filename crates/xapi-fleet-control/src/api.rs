//! Admin HTTP API.
//!
//! Thin axum layer over [`PoolControl`]. Errors are rendered as
//! `{"error": {"code": ..., "message": ...}}` with the status code of the
//! underlying [`ControlError`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use xapi_fleet_core::ServerId;

use crate::error::ControlError;
use crate::service::PoolControl;
use crate::types::{DomainObject, RegisterServerRequest, ServerView, UpdateServerRequest};

/// Create the admin router.
///
/// # Routes
///
/// - `GET /health` - Liveness
/// - `GET /ready` - Readiness (registrations readable)
/// - `GET /v1/servers` - List servers
/// - `POST /v1/servers` - Register a server
/// - `GET /v1/servers/:id` - Server status
/// - `PATCH /v1/servers/:id` - Update a registration
/// - `DELETE /v1/servers/:id` - Unregister a server
/// - `POST /v1/servers/:id/connect` - Connect
/// - `POST /v1/servers/:id/disconnect` - Disconnect
/// - `POST /v1/servers/:id/merge` - Join this server's pool into another
/// - `GET /v1/objects` - Reconciled objects
pub fn create_router<C>(control: Arc<C>) -> Router
where
    C: PoolControl + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready::<C>))
        .route(
            "/v1/servers",
            get(list_servers::<C>).post(register_server::<C>),
        )
        .route(
            "/v1/servers/:id",
            get(server_status::<C>)
                .patch(update_server::<C>)
                .delete(unregister_server::<C>),
        )
        .route("/v1/servers/:id/connect", post(connect_server::<C>))
        .route("/v1/servers/:id/disconnect", post(disconnect_server::<C>))
        .route("/v1/servers/:id/merge", post(merge_pools::<C>))
        .route("/v1/objects", get(list_objects::<C>))
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

// =============================================================================
// Errors
// =============================================================================

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The pool rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation is not allowed on a read-only server.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request is well-formed but cannot be served.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// The pool failed.
    #[error("upstream error: {0}")]
    BadGateway(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unprocessable(_) => "unprocessable",
            Self::BadGateway(_) => "bad_gateway",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let message = err.to_string();
        match err.http_status_code() {
            400 => Self::BadRequest(message),
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            422 => Self::Unprocessable(message),
            502 => Self::BadGateway(message),
            _ => {
                tracing::error!(error = %message, "Internal error");
                Self::Internal(message)
            }
        }
    }
}

fn parse_server_id(id: &str) -> Result<ServerId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid server id {id}: {e}")))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// Response for server list.
#[derive(Debug, Serialize)]
pub struct ListServersResponse {
    /// Registered servers.
    pub servers: Vec<ServerView>,
}

/// Response for object list.
#[derive(Debug, Serialize)]
pub struct ListObjectsResponse {
    /// Reconciled objects.
    pub objects: Vec<DomainObject>,
}

/// Request to merge a pool into another.
#[derive(Debug, Deserialize)]
pub struct MergeBody {
    /// Server whose pool is joined.
    pub target: String,
    /// Use `pool.join_force`.
    #[serde(default)]
    pub force: bool,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn ready<C: PoolControl + 'static>(State(control): State<Arc<C>>) -> Response {
    match control.list_servers().await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
            .into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "Not ready");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn list_servers<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
) -> Result<Json<ListServersResponse>, ApiError> {
    let servers = control.list_servers().await?;
    Ok(Json(ListServersResponse { servers }))
}

async fn register_server<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Json(request): Json<RegisterServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = control.register_server(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn server_status<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
) -> Result<Json<ServerView>, ApiError> {
    let server_id = parse_server_id(&id)?;
    Ok(Json(control.server_status(&server_id).await?))
}

async fn update_server<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateServerRequest>,
) -> Result<Json<ServerView>, ApiError> {
    let server_id = parse_server_id(&id)?;
    Ok(Json(control.update_server(&server_id, request).await?))
}

async fn unregister_server<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let server_id = parse_server_id(&id)?;
    control.unregister_server(&server_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn connect_server<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
) -> Result<Json<ServerView>, ApiError> {
    let server_id = parse_server_id(&id)?;
    Ok(Json(control.connect_server(&server_id).await?))
}

async fn disconnect_server<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
) -> Result<Json<ServerView>, ApiError> {
    let server_id = parse_server_id(&id)?;
    control.disconnect_server(&server_id).await?;
    Ok(Json(control.server_status(&server_id).await?))
}

async fn merge_pools<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
    Path(id): Path<String>,
    Json(body): Json<MergeBody>,
) -> Result<StatusCode, ApiError> {
    let source = parse_server_id(&id)?;
    let target = parse_server_id(&body.target)?;
    control.merge_pools(&source, &target, body.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_objects<C: PoolControl + 'static>(
    State(control): State<Arc<C>>,
) -> Result<Json<ListObjectsResponse>, ApiError> {
    let objects = control.list_objects().await?;
    Ok(Json(ListObjectsResponse { objects }))
}
