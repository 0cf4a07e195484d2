//! Router configuration for the depot API.
//!
//! # Route Structure
//!
//! ```text
//! /health                                        - Health check
//! /iiif/manifests/{resource_id}/manifest.json    - Manifest (CORS: any origin)
//! /api/resources/{resource_id}/status            - Processing status
//! /api/resources/{resource_id}                   - DELETE, owner only
//! ```
//!
//! IIIF viewers fetch manifests from arbitrary origins, so the manifest
//! route always allows any origin. The `/api` routes follow
//! [`RouterConfig::cors_origins`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get},
    Router,
};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    delete_handler, health_handler, manifest_handler, status_handler, AppState,
};
use super::identity::CALLER_HEADER;
use crate::service::ResourceService;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins for `/api` routes (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age for public manifests, in seconds
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set specific allowed CORS origins for `/api` routes.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router.
pub fn create_router(service: Arc<ResourceService>, config: RouterConfig) -> Router {
    let state = AppState::new(service).with_cache_max_age(config.cache_max_age);

    let iiif_routes = Router::new()
        .route(
            "/iiif/manifests/{resource_id}/manifest.json",
            get(manifest_handler),
        )
        .with_state(state.clone())
        .layer(manifest_cors_layer());

    let api_routes = Router::new()
        .route("/api/resources/{resource_id}/status", get(status_handler))
        .route("/api/resources/{resource_id}", delete(delete_handler))
        .with_state(state)
        .layer(build_cors_layer(&config));

    let router = Router::new()
        .route("/health", get(health_handler))
        .merge(iiif_routes)
        .merge(api_routes);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn manifest_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, CALLER_HEADER])
        .allow_origin(Any)
        .max_age(Duration::from_secs(86400))
}

/// Build the `/api` CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, CALLER_HEADER])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        // No origins allowed - this effectively disables CORS
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed)
        }
    }
}
