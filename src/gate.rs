use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::{future::Future, num::NonZeroU32, time::Duration};
use tokio::sync::Semaphore;

/// Batch-wide gate around the "submit to network" call.
///
/// Bounds both how many submissions are in flight and how fast new ones start.
/// Starts are spaced evenly with no burst, so at most `per_second` submissions
/// begin inside any window shorter than one second.
pub struct SendGate {
    permits: Semaphore,
    limiter: DefaultDirectRateLimiter,
}

impl SendGate {
    pub fn new(concurrency: usize, per_second: NonZeroU32) -> Self {
        let spacing = Duration::from_secs(1) / per_second.get();
        let quota = Quota::with_period(spacing)
            .unwrap_or_else(|| Quota::per_second(per_second))
            .allow_burst(NonZeroU32::MIN);
        Self {
            permits: Semaphore::new(concurrency.max(1)),
            limiter: RateLimiter::direct(quota),
        }
    }

    pub async fn submit<F, Fut, T>(&self, send: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Never closed, so acquire cannot fail.
        let _permit = self.permits.acquire().await;
        self.limiter.until_ready().await;
        send().await
    }
}
