use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::model::JobPayload;

use super::retry::RetryPolicy;

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub payload: JobPayload,
    /// 1-based number of the attempt this item represents
    pub attempt: u32,
    pub policy: RetryPolicy,
}

/// Sending half of the in-process job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

/// Receiving half, owned by exactly one [`super::WorkerPool`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<QueuedJob>,
}

/// Create a connected queue pair.
pub fn job_queue() -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobQueue { tx }, JobReceiver { rx })
}

impl JobQueue {
    /// Enqueue the first attempt of a Job.
    pub fn enqueue(
        &self,
        job_id: impl Into<String>,
        payload: JobPayload,
        policy: RetryPolicy,
    ) -> Result<(), DispatchError> {
        self.push(QueuedJob {
            job_id: job_id.into(),
            payload,
            attempt: 1,
            policy,
        })
    }

    fn push(&self, job: QueuedJob) -> Result<(), DispatchError> {
        self.tx.send(job).map_err(|_| DispatchError::QueueClosed)
    }

    /// Re-enqueue `job` as its next attempt once `delay` has elapsed.
    pub fn schedule_retry(&self, job: QueuedJob, delay: Duration) {
        let next = QueuedJob {
            attempt: job.attempt + 1,
            ..job
        };
        self.push_after(next, delay);
    }

    /// Enqueue a stored Job at a given attempt, after whatever is left of
    /// its retry delay. Used when resuming work from a previous process.
    pub fn resume(
        &self,
        job_id: impl Into<String>,
        payload: JobPayload,
        policy: RetryPolicy,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::QueueClosed);
        }
        self.push_after(
            QueuedJob {
                job_id: job_id.into(),
                payload,
                attempt: attempt.max(1),
                policy,
            },
            delay,
        );
        Ok(())
    }

    fn push_after(&self, job: QueuedJob, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(job_id = %job.job_id, attempt = job.attempt, "Retry enqueued");
            if queue.push(job).is_err() {
                warn!("Queue closed before retry could be enqueued");
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl JobReceiver {
    /// Next queued item, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        self.rx.recv().await
    }

    /// Stop accepting new items; already queued items can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
