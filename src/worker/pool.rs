use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::sync::Outcome;

use super::limiter::RateLimiter;
use super::processor::Processor;
use super::queue::{JobQueue, JobReceiver, QueuedJob};

/// Default number of simultaneous conversions.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default number of dequeues allowed per rate window.
pub const DEFAULT_RATE_LIMIT: u32 = 10;

/// Default rate window.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Limits applied by a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum in-flight items
    pub concurrency: usize,
    /// Maximum dequeues per `rate_window`, across all workers
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
        }
    }
}

impl PoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32, rate_window: Duration) -> Self {
        self.rate_limit = rate_limit;
        self.rate_window = rate_window;
        self
    }
}

/// Bounded-concurrency, rate-limited executor for queued Jobs.
///
/// Failed attempts are re-enqueued on the same [`JobQueue`] after the
/// item's backoff delay, so a retry is only ever scheduled once the failed
/// attempt has fully finished. The pending retry is also written to the Job
/// row, so a restart picks it up where this process left off.
pub struct WorkerPool {
    processor: Arc<Processor>,
    queue: JobQueue,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(processor: Processor, queue: JobQueue, config: PoolConfig) -> Self {
        Self {
            processor: Arc::new(processor),
            queue,
            config,
        }
    }

    /// Pull and execute items until `shutdown` resolves or the queue closes,
    /// then wait for in-flight items to finish.
    ///
    /// Items still queued at shutdown stay `waiting` in the store and are
    /// picked up again by the dispatcher's recovery on the next start.
    pub async fn run_until<F>(self, mut receiver: JobReceiver, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let limiter = RateLimiter::new(self.config.rate_limit, self.config.rate_window);
        tokio::pin!(shutdown);

        info!(
            concurrency,
            rate_limit = self.config.rate_limit,
            rate_window_ms = self.config.rate_window.as_millis() as u64,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                _ = &mut shutdown => break,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => {
                        debug!("Job queue closed");
                        break;
                    }
                },
            };

            tokio::select! {
                _ = &mut shutdown => {
                    debug!(job_id = %job.job_id, "Shutdown while rate limited, job left waiting");
                    break;
                }
                _ = limiter.acquire() => {}
            }

            let processor = Arc::clone(&self.processor);
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute(&processor, &queue, job).await;
            });
        }

        info!("Worker pool stopping, waiting for in-flight jobs");
        receiver.close();
        // Every permit back means every spawned attempt has finished
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!("Worker pool stopped");
    }
}

async fn execute(processor: &Processor, queue: &JobQueue, job: QueuedJob) {
    debug!(job_id = %job.job_id, attempt = job.attempt, "Attempt started");

    match processor.process(&job.job_id, &job.payload).await {
        Ok(outcome) => {
            debug!(job_id = %job.job_id, attempt = job.attempt, ?outcome, "Attempt finished");
        }
        Err(err) if job.policy.should_retry(job.attempt) => {
            let delay = job.policy.delay_after(job.attempt);
            match processor
                .park_for_retry(&job.job_id, job.attempt + 1, delay)
                .await
            {
                Ok(Outcome::Applied) => {}
                Ok(outcome) => {
                    debug!(job_id = %job.job_id, ?outcome, "Job moved on, retry dropped");
                    return;
                }
                Err(e) => {
                    // The in-process retry still runs; only restart recovery is lost
                    error!(job_id = %job.job_id, error = %e, "Failed to persist retry");
                }
            }
            warn!(
                job_id = %job.job_id,
                attempt = job.attempt,
                max_attempts = job.policy.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retry scheduled"
            );
            queue.schedule_retry(job, delay);
        }
        Err(err) => {
            error!(
                job_id = %job.job_id,
                attempts = job.attempt,
                error = %err,
                "Job failed permanently"
            );
        }
    }
}
