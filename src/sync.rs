//! State synchronizer: the only writer of Job, Image and Resource status.
//!
//! Each worker attempt drives one Image through these calls:
//!
//! ```text
//! begin_attempt ──► record_progress* ──┬──► complete_success ──► aggregate_resource
//!                                      └──► complete_failure ──► aggregate_resource
//!                                                  │
//!                                                  └──► schedule_retry (job back to waiting)
//! ```
//!
//! # Orphans
//!
//! A Resource may be deleted while its Images are still being converted.
//! Every operation first checks that the Image and its Resource still exist
//! and returns [`Outcome::Orphaned`] otherwise. That is a no-op, not an
//! error.
//!
//! # Exactly-once success
//!
//! The `processing -> ready` write is a compare-and-set on the stored Image
//! status, and the owner's ledger credit for the output lands in the same
//! store operation. `ready` is final, so only one caller can ever observe
//! [`Outcome::Applied`] from [`Synchronizer::complete_success`] for a given
//! Image, and a Resource deleted mid-flight never receives a late credit.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{Image, ImageStatus, Job, JobPayload, JobStatus, Resource, ResourceStatus};
use crate::store::Store;

/// Result of a synchronizer write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call performed the transition
    Applied,
    /// The entity was already in the requested state
    Unchanged,
    /// The Image or its Resource no longer exists
    Orphaned,
}

/// What a successful conversion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub width: u32,
    pub height: u32,
    pub output_path: PathBuf,
    /// Bytes written, credited to the owner's ledger entry
    pub output_size: u64,
}

/// Result of recomputing a Resource's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub status: ResourceStatus,
    /// Whether the stored status was rewritten
    pub changed: bool,
}

pub struct Synchronizer {
    store: Arc<dyn Store>,
    /// Serializes aggregation so a stale read cannot overwrite a newer result
    aggregate_lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            aggregate_lock: Mutex::new(()),
        }
    }

    /// Load an Image and confirm its Resource still exists.
    async fn live_image(&self, image_id: &str) -> Result<Option<Image>, SyncError> {
        let Some(image) = self.store.get_image(image_id).await? else {
            return Ok(None);
        };
        if self.store.get_resource(&image.resource_id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(image))
    }

    // =========================================================================
    // Attempt lifecycle
    // =========================================================================

    /// Start an attempt: Image `processing`, Job `active`.
    ///
    /// An existing Job row keeps its id; its progress and error are reset and
    /// it gets a fresh `started_at`. Returns [`Outcome::Unchanged`] when the
    /// Image is already `ready`, in which case there is nothing to convert.
    pub async fn begin_attempt(
        &self,
        job_id: &str,
        payload: &JobPayload,
    ) -> Result<Outcome, SyncError> {
        let Some(mut image) = self.live_image(&payload.image_id).await? else {
            debug!(job_id, image_id = %payload.image_id, "Attempt for orphaned image ignored");
            return Ok(Outcome::Orphaned);
        };

        if image.status == ImageStatus::Ready {
            return Ok(Outcome::Unchanged);
        }

        let previous = image.status;
        if previous != ImageStatus::Processing {
            image.status = previous.transition(ImageStatus::Processing)?;
        }
        image.job_id = Some(job_id.to_string());
        image.error_message = None;

        if !self.store.update_image(&image, previous).await? {
            debug!(job_id, image_id = %image.id, "Image changed underneath attempt start");
            return Ok(Outcome::Orphaned);
        }

        let now = Utc::now();
        match self.store.get_job(job_id).await? {
            Some(mut job) => {
                info!(job_id, image_id = %image.id, from = %job.status, "Reactivating job");
                job.status = match job.status.transition(JobStatus::Active) {
                    Ok(status) => status,
                    // active (crashed worker) and completed go back through waiting
                    Err(_) => job
                        .status
                        .transition(JobStatus::Waiting)?
                        .transition(JobStatus::Active)?,
                };
                job.progress = 0;
                job.error = None;
                job.retry_at = None;
                job.started_at = Some(now);
                job.completed_at = None;
                self.store.update_job(&job).await?;
            }
            None => {
                let mut job = Job::waiting(job_id, &image.id);
                job.status = job.status.transition(JobStatus::Active)?;
                job.started_at = Some(now);
                self.store.insert_job(&job).await?;
            }
        }

        self.aggregate_resource(&image.resource_id).await?;
        Ok(Outcome::Applied)
    }

    /// Persist a progress checkpoint for a running Job.
    pub async fn record_progress(&self, job_id: &str, progress: u8) -> Result<Outcome, SyncError> {
        if self.store.set_job_progress(job_id, progress.min(100)).await? {
            debug!(job_id, progress, "Progress checkpoint");
            Ok(Outcome::Applied)
        } else {
            Ok(Outcome::Orphaned)
        }
    }

    /// Finish an attempt successfully: Image `ready` with its dimensions and
    /// output, the output size credited to the owner, Job `completed` at 100%,
    /// then re-aggregate the Resource.
    pub async fn complete_success(
        &self,
        job_id: &str,
        image_id: &str,
        conversion: &Conversion,
    ) -> Result<Outcome, SyncError> {
        let Some(mut image) = self.live_image(image_id).await? else {
            debug!(job_id, image_id, "Completion for orphaned image ignored");
            return Ok(Outcome::Orphaned);
        };

        if image.status == ImageStatus::Ready {
            debug!(job_id, image_id, "Duplicate completion ignored");
            return Ok(Outcome::Unchanged);
        }

        image.status = image.status.transition(ImageStatus::Ready)?;
        image.width = Some(conversion.width);
        image.height = Some(conversion.height);
        image.output_path = Some(conversion.output_path.clone());
        image.output_size = Some(conversion.output_size);
        image.error_message = None;

        if !self.store.mark_ready_and_credit(&image).await? {
            // Lost the race: deleted, or another report got there first
            return Ok(match self.live_image(image_id).await? {
                Some(_) => Outcome::Unchanged,
                None => Outcome::Orphaned,
            });
        }

        if let Some(mut job) = self.store.get_job(job_id).await? {
            if job.status != JobStatus::Completed {
                job.status = job.status.transition(JobStatus::Completed)?;
            }
            job.progress = 100;
            job.error = None;
            job.completed_at = Some(Utc::now());
            self.store.update_job(&job).await?;
        }

        info!(
            job_id,
            image_id,
            width = conversion.width,
            height = conversion.height,
            bytes = conversion.output_size,
            "Image ready"
        );
        self.aggregate_resource(&image.resource_id).await?;
        Ok(Outcome::Applied)
    }

    /// Finish an attempt with a failure: Image `failed` and Job `failed`, both
    /// carrying `error`, then re-aggregate the Resource.
    ///
    /// An Image that is already `ready` is left alone.
    pub async fn complete_failure(
        &self,
        job_id: &str,
        image_id: &str,
        error: &str,
    ) -> Result<Outcome, SyncError> {
        let Some(mut image) = self.live_image(image_id).await? else {
            debug!(job_id, image_id, "Failure for orphaned image ignored");
            return Ok(Outcome::Orphaned);
        };

        if image.status == ImageStatus::Ready {
            return Ok(Outcome::Unchanged);
        }

        let previous = image.status;
        if previous != ImageStatus::Failed {
            image.status = previous.transition(ImageStatus::Failed)?;
        }
        image.error_message = Some(error.to_string());

        if !self.store.update_image(&image, previous).await? {
            return Ok(match self.live_image(image_id).await? {
                Some(_) => Outcome::Unchanged,
                None => Outcome::Orphaned,
            });
        }

        if let Some(mut job) = self.store.get_job(job_id).await? {
            if job.status != JobStatus::Failed {
                job.status = job.status.transition(JobStatus::Failed)?;
            }
            job.error = Some(error.to_string());
            job.completed_at = Some(Utc::now());
            self.store.update_job(&job).await?;
        }

        warn!(job_id, image_id, error, "Image failed");
        self.aggregate_resource(&image.resource_id).await?;
        Ok(Outcome::Applied)
    }

    /// Park a failed Job in `waiting` until `retry_at`, recording the number
    /// of the attempt that will run then.
    ///
    /// The schedule lives on the Job row so a restart can resume it. Returns
    /// [`Outcome::Unchanged`] when the Job is no longer `failed` (it was
    /// re-dispatched or finished meanwhile); only an applied schedule should
    /// be followed by a queued retry.
    pub async fn schedule_retry(
        &self,
        job_id: &str,
        attempt: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Outcome, SyncError> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            debug!(job_id, "Retry for deleted job dropped");
            return Ok(Outcome::Orphaned);
        };
        if job.status != JobStatus::Failed {
            return Ok(Outcome::Unchanged);
        }

        job.status = job.status.transition(JobStatus::Waiting)?;
        job.attempt = attempt;
        job.retry_at = Some(retry_at);
        if !self.store.update_job(&job).await? {
            return Ok(Outcome::Orphaned);
        }
        debug!(job_id, attempt, retry_at = %retry_at, "Retry scheduled");
        Ok(Outcome::Applied)
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Recompute a Resource's status from its Images and store it if it
    /// differs. Returns `None` if the Resource no longer exists.
    pub async fn aggregate_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<Aggregation>, SyncError> {
        let _guard = self.aggregate_lock.lock().await;

        let Some(resource) = self.store.get_resource(resource_id).await? else {
            debug!(resource_id, "Aggregation for deleted resource ignored");
            return Ok(None);
        };

        let images = self.store.images_for_resource(resource_id).await?;
        let status = ResourceStatus::aggregate(images.iter().map(|image| image.status));

        if status == resource.status {
            return Ok(Some(Aggregation {
                status,
                changed: false,
            }));
        }

        let changed = self.store.set_resource_status(resource_id, status).await?;
        if changed {
            log_resource_change(&resource, status, images.len());
        }
        Ok(Some(Aggregation { status, changed }))
    }
}

fn log_resource_change(resource: &Resource, status: ResourceStatus, image_count: usize) {
    match status {
        ResourceStatus::Processing => {
            debug!(resource_id = %resource.id, from = %resource.status, "Resource processing")
        }
        ResourceStatus::Ready | ResourceStatus::Failed => info!(
            resource_id = %resource.id,
            from = %resource.status,
            to = %status,
            images = image_count,
            "Resource status updated"
        ),
    }
}

// =============================================================================
// Tests
// =============================================================================
