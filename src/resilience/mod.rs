//! Retry and throttling for remote calls
//!
//! Every provider request goes through a [`ResiliencePipeline`]:
//! - Throttle: a concurrency cap or a sliding-window rate limit, acquired
//!   per attempt and released before any backoff sleep
//! - Retry: only rate-limited failures, at most [`MAX_RETRY_ATTEMPTS`]
//!   times, on a fixed three-tier delay table plus jitter

mod limiter;

pub use limiter::SlidingWindowLimiter;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{CloudSyncError, Result};

/// Retries after the initial attempt
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Upper bound of the random jitter added to each backoff delay
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);

/// Base delay before retry number `attempt` (0-based)
///
/// This is a lookup table, not an exponential formula.
pub fn backoff_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::ZERO,
        1 => Duration::from_secs(1),
        _ => Duration::from_secs(5),
    }
}

/// Admission policy applied to each attempt
pub enum Throttle {
    Unlimited,
    /// At most N requests in flight
    Concurrency(Arc<Semaphore>),
    /// At most N requests started per sliding window
    SlidingWindow(SlidingWindowLimiter),
}

impl Throttle {
    async fn admit(&self) -> Result<Option<SemaphorePermit<'_>>> {
        match self {
            Throttle::Unlimited => Ok(None),
            Throttle::Concurrency(semaphore) => semaphore
                .acquire()
                .await
                .map(Some)
                .map_err(|e| CloudSyncError::Internal(format!("Throttle closed: {}", e))),
            Throttle::SlidingWindow(limiter) => {
                limiter.acquire().await;
                Ok(None)
            }
        }
    }
}

/// Wraps remote operations with throttling and rate-limit retries
pub struct ResiliencePipeline {
    throttle: Throttle,
    max_retries: u32,
    max_jitter: Duration,
}

impl ResiliencePipeline {
    pub fn new(throttle: Throttle) -> Self {
        Self {
            throttle,
            max_retries: MAX_RETRY_ATTEMPTS,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Cap the number of in-flight requests
    pub fn concurrency_limited(max_in_flight: usize) -> Self {
        Self::new(Throttle::Concurrency(Arc::new(Semaphore::new(max_in_flight))))
    }

    /// Cap requests per sliding window split into `segments`
    pub fn sliding_window(permit_limit: usize, window: Duration, segments: u32) -> Self {
        Self::new(Throttle::SlidingWindow(SlidingWindowLimiter::new(
            permit_limit,
            window,
            segments,
        )))
    }

    /// Policy for path-addressed stores: 9 requests in flight
    pub fn for_path_store() -> Self {
        Self::concurrency_limited(9)
    }

    /// Policy for graph-addressed stores: 12000 requests per minute in 4 segments
    pub fn for_graph_store() -> Self {
        Self::sliding_window(12_000, Duration::from_secs(60), 4)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `op`, retrying it while it fails with a rate-limit error
    ///
    /// After the last retry the final error is returned as-is.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let outcome = {
                let _permit = self.throttle.admit().await?;
                op().await
            };

            match outcome {
                Ok(value) => {
                    if retries > 0 {
                        tracing::debug!(operation, retries, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_rate_limited() && retries < self.max_retries => {
                    let delay = backoff_delay(retries) + self.jitter();
                    tracing::warn!(
                        operation,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn quiet(pipeline: ResiliencePipeline) -> ResiliencePipeline {
        pipeline.with_max_jitter(Duration::ZERO)
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(5));
        assert_eq!(backoff_delay(7), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_until_exhausted() {
        let pipeline = quiet(ResiliencePipeline::new(Throttle::Unlimited));
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let result: Result<()> = pipeline
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudSyncError::RateLimited("429".into()))
            })
            .await;

        assert!(matches!(result, Err(CloudSyncError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_RETRY_ATTEMPTS as usize);
        // 0s + 1s + 5s
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_not_retried() {
        let pipeline = quiet(ResiliencePipeline::new(Throttle::Unlimited));
        let calls = AtomicUsize::new(0);

        let result: Result<()> = pipeline
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudSyncError::Api {
                    status: 500,
                    message: "server".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(CloudSyncError::Api { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_rate_limit() {
        let pipeline = quiet(ResiliencePipeline::new(Throttle::Unlimited));
        let calls = AtomicUsize::new(0);

        let value = pipeline
            .execute("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CloudSyncError::RateLimited("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let pipeline = Arc::new(quiet(ResiliencePipeline::concurrency_limited(9)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..30 {
            let pipeline = pipeline.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .execute("test", || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 9);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }
}
