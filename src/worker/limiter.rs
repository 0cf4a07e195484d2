use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter shared by every worker of a pool.
///
/// At most `max` acquisitions complete within any `window`.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        let max = (max as usize).max(1);
        Self {
            max,
            window,
            grants: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Wait until one more acquisition fits in the window.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut grants = self.grants.lock().await;
                let now = Instant::now();
                while grants
                    .front()
                    .is_some_and(|&granted| now.duration_since(granted) >= self.window)
                {
                    grants.pop_front();
                }

                if grants.len() < self.max {
                    grants.push_back(now);
                    return;
                }

                match grants.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}
