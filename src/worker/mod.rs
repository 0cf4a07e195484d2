//! Worker pool and the machinery around it.
//!
//! ```text
//!  Dispatcher ──enqueue──► JobQueue ──► WorkerPool ──spawn──► Processor
//!                             ▲          │ semaphore (concurrency)
//!                             │          │ RateLimiter (dequeues / window)
//!                             │          ▼
//!                             └── schedule_retry(backoff) on failure
//! ```
//!
//! The queue is an in-process channel. Durability comes from the Job rows in
//! the store: anything lost from the channel by a restart is still `waiting`
//! or `active` there and is re-enqueued by [`crate::Dispatcher::recover`].

mod limiter;
mod pool;
mod processor;
mod queue;
mod retry;

pub use limiter::RateLimiter;
pub use pool::{
    PoolConfig, WorkerPool, DEFAULT_CONCURRENCY, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW,
};
pub use processor::{Processor, PROGRESS_ACCEPTED, PROGRESS_CONVERTED, PROGRESS_MEASURED};
pub use queue::{job_queue, JobQueue, JobReceiver, QueuedJob};
pub use retry::{Backoff, RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS};
