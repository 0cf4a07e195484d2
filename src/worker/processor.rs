use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::convert::{ConvertOptions, Converter};
use crate::error::{ConvertError, ProcessError};
use crate::model::JobPayload;
use crate::sync::{Conversion, Outcome, Synchronizer};

/// Progress after the attempt has been accepted.
pub const PROGRESS_ACCEPTED: u8 = 10;

/// Progress after the dimension measurement.
pub const PROGRESS_MEASURED: u8 = 30;

/// Progress after the pyramid has been written.
pub const PROGRESS_CONVERTED: u8 = 80;

/// Drives a single queued item through the converter and the synchronizer.
///
/// The owner's ledger is credited by the synchronizer's success write, not
/// here, so a completion can never credit an Image that has been deleted.
pub struct Processor {
    sync: Arc<Synchronizer>,
    converter: Arc<dyn Converter>,
    options: ConvertOptions,
}

impl Processor {
    pub fn new(sync: Arc<Synchronizer>, converter: Arc<dyn Converter>) -> Self {
        Self {
            sync,
            converter,
            options: ConvertOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConvertOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one attempt.
    ///
    /// On failure the Image and Job are marked `failed` before the error is
    /// returned, so the caller only has to decide whether to retry. Failures
    /// of Images that were deleted mid-flight are swallowed and reported as
    /// [`Outcome::Orphaned`].
    pub async fn process(
        &self,
        job_id: &str,
        payload: &JobPayload,
    ) -> Result<Outcome, ProcessError> {
        match self.sync.begin_attempt(job_id, payload).await? {
            Outcome::Applied => {}
            Outcome::Orphaned => return Ok(Outcome::Orphaned),
            Outcome::Unchanged => {
                debug!(job_id, image_id = %payload.image_id, "Image already ready, nothing to do");
                self.sync.aggregate_resource(&payload.resource_id).await?;
                return Ok(Outcome::Unchanged);
            }
        }

        match self.run(job_id, payload).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let recorded = self
                    .sync
                    .complete_failure(job_id, &payload.image_id, &err.to_string())
                    .await?;
                if recorded == Outcome::Orphaned {
                    debug!(job_id, error = %err, "Failure of orphaned job dropped");
                    return Ok(Outcome::Orphaned);
                }
                Err(err)
            }
        }
    }

    async fn run(&self, job_id: &str, payload: &JobPayload) -> Result<Outcome, ProcessError> {
        if !self.checkpoint(job_id, PROGRESS_ACCEPTED).await? {
            return Ok(Outcome::Orphaned);
        }

        let dims = self.converter.measure(&payload.source_path).await?;
        debug!(job_id, width = dims.width, height = dims.height, "Dimensions measured");
        if !self.checkpoint(job_id, PROGRESS_MEASURED).await? {
            return Ok(Outcome::Orphaned);
        }

        let output = self
            .converter
            .convert(&payload.source_path, &payload.output_path, &self.options)
            .await?;
        if !self.checkpoint(job_id, PROGRESS_CONVERTED).await? {
            discard_output(&output).await;
            return Ok(Outcome::Orphaned);
        }

        let output_size = tokio::fs::metadata(&output)
            .await
            .map_err(|e| ConvertError::Io(format!("{}: {}", output.display(), e)))?
            .len();

        let conversion = Conversion {
            width: dims.width,
            height: dims.height,
            output_path: output.clone(),
            output_size,
        };

        let outcome = self
            .sync
            .complete_success(job_id, &payload.image_id, &conversion)
            .await?;

        match outcome {
            Outcome::Applied => {
                info!(
                    job_id,
                    image_id = %payload.image_id,
                    user_id = %payload.user_id,
                    bytes = output_size,
                    "Image processed"
                );
            }
            Outcome::Orphaned => discard_output(&output).await,
            Outcome::Unchanged => {}
        }

        Ok(outcome)
    }

    /// Record that `attempt` of a failed Job should run after `delay`.
    ///
    /// Returns [`Outcome::Applied`] only when the schedule was stored; any
    /// other outcome means the retry must not be queued.
    pub async fn park_for_retry(
        &self,
        job_id: &str,
        attempt: u32,
        delay: Duration,
    ) -> Result<Outcome, ProcessError> {
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self.sync.schedule_retry(job_id, attempt, retry_at).await?)
    }

    /// Persist a checkpoint. Returns `false` once the Job has been deleted.
    async fn checkpoint(&self, job_id: &str, progress: u8) -> Result<bool, ProcessError> {
        Ok(self.sync.record_progress(job_id, progress).await? == Outcome::Applied)
    }
}

async fn discard_output(output: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(output).await {
        debug!(output = %output.display(), error = %e, "Could not remove orphaned output");
    }
}
