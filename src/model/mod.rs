//! Domain model for the ingestion pipeline.
//!
//! ```text
//! Resource 1 ──< Image 1 ──1 Job
//!    │              │
//!    └── owned by ──┴── User (ledger entry)
//! ```
//!
//! Jobs and Images carry explicit state machines (see [`status`]); a
//! Resource's status is always recomputed from its Images.

mod entities;
mod payload;
pub mod status;

pub use entities::{Image, Job, Resource, User, ViewingDirection, Visibility};
pub use payload::JobPayload;
pub use status::{ImageStatus, JobStatus, ResourceStatus};
