//! # iiif-depot
//!
//! An image ingestion pipeline that turns uploaded images into tiled
//! pyramidal TIFFs and publishes them as IIIF Presentation 3 manifests.
//!
//! Uploaded images are grouped into Resources. Each image gets exactly one
//! Job; a bounded, rate-limited worker pool converts it, retrying with
//! exponential backoff, while the state synchronizer keeps Job, Image and
//! Resource statuses consistent and the quota ledger charges each user for
//! the bytes their conversions produce.
//!
//! ## Architecture
//!
//! ```text
//!   upload tier ──► images (uploaded)
//!                        │
//!                  ┌─────▼──────┐   JobQueue   ┌────────────┐
//!                  │ Dispatcher │─────────────►│ WorkerPool │
//!                  └────────────┘              └─────┬──────┘
//!                                                    │ Processor
//!                                    ┌───────────────┴───────┐
//!                                    ▼                       ▼
//!                               Converter              Synchronizer
//!                                                            │ ready + credit
//!            HTTP ──► ResourceService ──► QuotaLedger ──► Store
//!                          │                                 │
//!                          └──────► build_manifest ◄─────────┘
//! ```
//!
//! - [`model`] - Entities and their status machines
//! - [`store`] - Storage contract with SQLite and in-memory backends
//! - [`dispatch`] - Job creation and enqueueing
//! - [`worker`] - Queue, retry policy, rate limiter and worker pool
//! - [`sync`] - Per-attempt state transitions and Resource aggregation
//! - [`ledger`] - Per-user storage accounting
//! - [`convert`] - Conversion tool contract and ImageMagick backend
//! - [`manifest`] - IIIF Presentation 3 document builder
//! - [`service`] - Manifest reads, status polling and deletion
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types

pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod model;
pub mod server;
pub mod service;
pub mod store;
pub mod sync;
pub mod worker;

// Re-export commonly used types
pub use config::{CheckConfig, Cli, Command, ServeConfig, StorageConfig};
pub use convert::{
    Compression, ConvertOptions, Converter, Dimensions, MagickConverter, TimeoutConverter,
};
pub use dispatch::{job_id_for, output_path_for, Dispatcher};
pub use error::{
    ConvertError, DispatchError, LedgerError, ManifestError, ProcessError, ResourceError,
    StoreError, SyncError, TransitionError,
};
pub use ledger::{QuotaLedger, Usage, UsageWarning};
pub use manifest::{build_manifest, Manifest, ManifestConfig};
pub use model::{
    Image, ImageStatus, Job, JobPayload, JobStatus, Resource, ResourceStatus, User, Visibility,
};
pub use server::{create_router, AppState, RouterConfig};
pub use service::{DeletionReport, ImageProgress, ResourceService, StatusReport};
pub use store::{MemoryStore, SqliteStore, Store};
pub use sync::{Outcome, Synchronizer};
pub use worker::{job_queue, JobQueue, PoolConfig, Processor, RetryPolicy, WorkerPool};
