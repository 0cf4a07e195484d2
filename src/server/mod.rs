//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │     GET /iiif/manifests/{id}/manifest.json                      │
//! │     GET /api/resources/{id}/status                              │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │  identity   │  │        routes           │  │
//! │  │ (requests)  │  │ (caller hdr)│  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                ▼
//!                         ResourceService
//! ```

pub mod handlers;
pub mod identity;
pub mod routes;

pub use handlers::{
    delete_handler, health_handler, manifest_handler, status_handler, AppState, ErrorResponse,
    HealthResponse,
};
pub use identity::{Caller, CALLER_HEADER};
pub use routes::{create_router, RouterConfig};
