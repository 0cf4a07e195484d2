//! HTTP request handlers for the depot API.
//!
//! # Endpoints
//!
//! - `GET /iiif/manifests/{resource_id}/manifest.json` - IIIF Presentation 3 manifest
//! - `GET /api/resources/{resource_id}/status` - Processing progress
//! - `DELETE /api/resources/{resource_id}` - Owner-only deletion
//! - `GET /health` - Health check endpoint

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{LedgerError, ResourceError};
use crate::manifest::PRESENTATION_CONTEXT;
use crate::model::Visibility;
use crate::service::{DeletionReport, ResourceService, StatusReport};

use super::identity::Caller;

/// Seconds a client should wait before asking again for a manifest that is
/// still being processed.
pub const NOT_READY_RETRY_AFTER: u32 = 5;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state, passed to handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ResourceService>,

    /// Cache-Control max-age for public manifests, in seconds
    pub cache_max_age: u32,
}

impl AppState {
    pub fn new(service: Arc<ResourceService>) -> Self {
        Self {
            service,
            cache_max_age: 3600,
        }
    }

    pub fn with_cache_max_age(mut self, cache_max_age: u32) -> Self {
        self.cache_max_age = cache_max_age;
        self
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "not_ready")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// =============================================================================
// Error Conversion
// =============================================================================

impl IntoResponse for ResourceError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ResourceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ResourceError::AccessDenied { .. } => (StatusCode::FORBIDDEN, "access_denied"),
            ResourceError::NotReady { .. } => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
            ResourceError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ResourceError::Ledger(LedgerError::QuotaExceeded { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "quota_exceeded")
            }
            ResourceError::Ledger(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ledger_error"),
        };
        let message = self.to_string();

        // Log errors based on severity
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND || status == StatusCode::SERVICE_UNAVAILABLE {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "{}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let body = Json(ErrorResponse::with_status(error_type, message, status));
        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(NOT_READY_RETRY_AFTER),
            );
        }
        response
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Serve the manifest of a ready Resource.
///
/// # Endpoint
///
/// `GET /iiif/manifests/{resource_id}/manifest.json`
///
/// # Response
///
/// - 200 with `application/ld+json` on success
/// - 404 if the Resource does not exist
/// - 403 if it is private and the caller is not its owner
/// - 503 with `Retry-After` while it is processing, or if it failed
pub async fn manifest_handler(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    caller: Caller,
) -> Result<Response, ResourceError> {
    let manifest = state
        .service
        .manifest(&resource_id, caller.user_id())
        .await?;

    let cache_control = match manifest_visibility(&state, &resource_id).await {
        Visibility::Public => format!("public, max-age={}", state.cache_max_age),
        Visibility::Private => "private, no-store".to_string(),
    };

    let content_type = format!("application/ld+json;profile=\"{}\"", PRESENTATION_CONTEXT);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache_control),
        ],
        Json(manifest),
    )
        .into_response())
}

async fn manifest_visibility(state: &AppState, resource_id: &str) -> Visibility {
    match state.service.visibility(resource_id).await {
        Ok(Some(visibility)) => visibility,
        // Treat anything uncertain as private so it is never cached publicly
        _ => Visibility::Private,
    }
}

/// Report per-Image processing progress.
///
/// # Endpoint
///
/// `GET /api/resources/{resource_id}/status`
pub async fn status_handler(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
) -> Result<Response, ResourceError> {
    let report: StatusReport = state.service.status(&resource_id).await?;
    Ok((
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(report),
    )
        .into_response())
}

/// Delete a Resource owned by the caller.
///
/// # Endpoint
///
/// `DELETE /api/resources/{resource_id}`
///
/// Anonymous callers are refused with 403.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    caller: Caller,
) -> Result<Json<DeletionReport>, ResourceError> {
    let Some(user_id) = caller.user_id() else {
        return Err(ResourceError::AccessDenied { resource_id });
    };
    let report = state.service.delete_resource(&resource_id, user_id).await?;
    Ok(Json(report))
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
