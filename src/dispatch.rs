//! Job dispatcher.
//!
//! Turns a request to process one Image into a durable Job row plus a queued
//! work item. Every Image has exactly one Job, keyed `process-{image_id}`;
//! dispatching again resets that row instead of creating another.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::model::{Image, ImageStatus, Job, JobPayload, JobStatus};
use crate::store::Store;
use crate::worker::{JobQueue, RetryPolicy};

/// Stable Job id for an Image.
pub fn job_id_for(image_id: &str) -> String {
    format!("process-{}", image_id)
}

/// Pyramid TIFF location for a source file: `<output_dir>/<stem>.tif`.
pub fn output_path_for(source: &Path, output_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output_dir.join(format!("{}.tif", stem))
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: JobQueue,
    output_dir: PathBuf,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, queue: JobQueue, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            queue,
            output_dir: output_dir.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Create or reset the Image's Job in `waiting` and enqueue `request`.
    ///
    /// Returns the Job id. Refuses Images that are already `ready` and Jobs
    /// that are currently `active`.
    pub async fn dispatch(&self, request: JobPayload) -> Result<String, DispatchError> {
        let mut image = self
            .store
            .get_image(&request.image_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownImage(request.image_id.clone()))?;

        if image.status == ImageStatus::Ready {
            return Err(DispatchError::AlreadyReady(image.id));
        }

        let job_id = job_id_for(&image.id);
        match self.store.get_job(&job_id).await? {
            Some(job) if job.status == JobStatus::Active => {
                return Err(DispatchError::InFlight(job_id));
            }
            Some(mut job) => {
                if job.status != JobStatus::Waiting {
                    job.status = job.status.transition(JobStatus::Waiting)?;
                }
                job.progress = 0;
                job.error = None;
                job.attempt = 1;
                job.retry_at = None;
                job.started_at = None;
                job.completed_at = None;
                self.store.update_job(&job).await?;
                debug!(job_id = %job_id, "Existing job reset to waiting");
            }
            None => {
                self.store
                    .insert_job(&Job::waiting(&job_id, &image.id))
                    .await?;
            }
        }

        if image.job_id.as_deref() != Some(job_id.as_str()) {
            let current = image.status;
            image.job_id = Some(job_id.clone());
            self.store.update_image(&image, current).await?;
        }

        self.queue.enqueue(&job_id, request, self.policy)?;
        info!(job_id = %job_id, image_id = %image.id, resource_id = %image.resource_id, "Job dispatched");
        Ok(job_id)
    }

    /// Dispatch a stored Image, deriving its output path from the configured
    /// output directory.
    pub async fn dispatch_image(&self, image_id: &str) -> Result<String, DispatchError> {
        let image = self
            .store
            .get_image(image_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownImage(image_id.to_string()))?;
        self.dispatch(self.payload_for(&image)).await
    }

    fn payload_for(&self, image: &Image) -> JobPayload {
        JobPayload::new(
            &image.id,
            &image.resource_id,
            &image.user_id,
            image.source_path.clone(),
            output_path_for(&image.source_path, &self.output_dir),
        )
    }

    /// Dispatch every uploaded Image that has never been given a Job.
    ///
    /// The upload tier only records Images; this sweep is what turns them
    /// into queued work. Returns the number of Jobs dispatched.
    pub async fn dispatch_new_uploads(&self) -> Result<usize, DispatchError> {
        let images = self.store.undispatched_images().await?;
        let mut dispatched = 0;
        for image in &images {
            match self.dispatch(self.payload_for(image)).await {
                Ok(_) => dispatched += 1,
                // Deleted or picked up between the scan and the dispatch
                Err(DispatchError::UnknownImage(_))
                | Err(DispatchError::AlreadyReady(_))
                | Err(DispatchError::InFlight(_)) => {
                    debug!(image_id = %image.id, "Upload no longer needs dispatching");
                }
                Err(e) => return Err(e),
            }
        }
        if dispatched > 0 {
            info!(count = dispatched, "Dispatched new uploads");
        }
        Ok(dispatched)
    }

    /// Re-enqueue Jobs left `waiting` or `active` by a previous process.
    ///
    /// `active` rows belong to attempts that died with the process; they go
    /// back to `waiting` and run again under the same attempt number. A Job
    /// parked for a retry keeps its attempt number and waits out whatever is
    /// left of its delay. Returns the number of Jobs re-enqueued.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let jobs = self
            .store
            .jobs_with_status(&[JobStatus::Waiting, JobStatus::Active])
            .await?;

        let now = Utc::now();
        let mut recovered = 0;
        for mut job in jobs {
            let image = match self.store.get_image(&job.image_id).await? {
                Some(image) if image.status != ImageStatus::Ready => image,
                _ => {
                    debug!(job_id = %job.id, "Nothing to recover");
                    continue;
                }
            };

            if job.status == JobStatus::Active {
                job.status = job.status.transition(JobStatus::Waiting)?;
                job.progress = 0;
                self.store.update_job(&job).await?;
            }

            let delay = job.retry_delay(now);
            if let Err(e) = self.queue.resume(
                &job.id,
                self.payload_for(&image),
                self.policy,
                job.attempt,
                delay,
            ) {
                warn!(job_id = %job.id, error = %e, "Failed to recover job");
                return Err(e);
            }
            debug!(
                job_id = %job.id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                "Job resumed"
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered unfinished jobs");
        }
        Ok(recovered)
    }
}
