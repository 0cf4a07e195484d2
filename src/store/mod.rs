//! Storage layer contract.
//!
//! The pipeline never talks to a database directly; it goes through the
//! [`Store`] trait so the same synchronizer, ledger and dispatcher code runs
//! against SQLite in production and an in-memory map in tests.
//!
//! # Concurrency contract
//!
//! Implementations must make each method atomic on its own:
//!
//! - [`Store::increment_storage_used`] / [`Store::decrement_storage_used`] are
//!   single counter updates (`storage_used = storage_used + ?`), never a read
//!   followed by a write, because two Images of one user may complete at the
//!   same moment on different workers.
//! - [`Store::update_image`] is a compare-and-set on the Image's current
//!   status, so a stale or duplicate completion report cannot overwrite a
//!   newer state.
//! - [`Store::mark_ready_and_credit`] performs the `processing -> ready`
//!   write and the owner's storage increment as one unit. A Resource deleted
//!   at any point around it either sees the output size on the row it
//!   removes, or leaves nothing for the write to match.
//! - Deleting a Resource cascades to its Images and their Jobs.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Image, ImageStatus, Job, JobStatus, Resource, ResourceStatus, User};

#[async_trait]
pub trait Store: Send + Sync {
    // ---- users / ledger -----------------------------------------------------

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Atomically add `bytes` to the user's `storage_used`.
    ///
    /// Returns the new value, or `None` if the user does not exist.
    async fn increment_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError>;

    /// Atomically subtract `bytes` from the user's `storage_used`, clamping at 0.
    ///
    /// Returns the new value, or `None` if the user does not exist.
    async fn decrement_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError>;

    // ---- resources ----------------------------------------------------------

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>, StoreError>;

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Overwrite the stored aggregate status. Returns `false` if the resource
    /// no longer exists.
    async fn set_resource_status(
        &self,
        resource_id: &str,
        status: ResourceStatus,
    ) -> Result<bool, StoreError>;

    /// Delete a resource together with its Images and Jobs.
    ///
    /// Returns the Images that were removed, or `None` if the resource did
    /// not exist.
    async fn delete_resource(&self, resource_id: &str) -> Result<Option<Vec<Image>>, StoreError>;

    // ---- images -------------------------------------------------------------

    async fn get_image(&self, image_id: &str) -> Result<Option<Image>, StoreError>;

    async fn insert_image(&self, image: &Image) -> Result<(), StoreError>;

    /// All images of a resource ordered by `order_index`.
    async fn images_for_resource(&self, resource_id: &str) -> Result<Vec<Image>, StoreError>;

    /// Images still `uploaded` that were never given a Job, ordered by
    /// resource then `order_index`.
    async fn undispatched_images(&self) -> Result<Vec<Image>, StoreError>;

    /// Replace the stored image if its current status equals `expected`.
    ///
    /// Returns `false` when the image is gone or its status has moved on.
    async fn update_image(&self, image: &Image, expected: ImageStatus)
        -> Result<bool, StoreError>;

    /// Store `image` (status `ready`, output recorded) if the stored row is
    /// still `processing`, and in the same unit add its `output_size` to the
    /// owner's `storage_used`.
    ///
    /// Returns `false`, changing nothing, when the image is gone or no longer
    /// `processing`.
    async fn mark_ready_and_credit(&self, image: &Image) -> Result<bool, StoreError>;

    // ---- jobs ---------------------------------------------------------------

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Replace a stored job. Returns `false` if it no longer exists.
    async fn update_job(&self, job: &Job) -> Result<bool, StoreError>;

    /// Persist a progress checkpoint. Returns `false` if the job no longer exists.
    async fn set_job_progress(&self, job_id: &str, progress: u8) -> Result<bool, StoreError>;

    /// Jobs of every image in a resource.
    async fn jobs_for_resource(&self, resource_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Jobs currently in any of the given statuses, oldest first.
    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError>;
}
