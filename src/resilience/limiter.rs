//! Sliding-window rate limiter
//!
//! The window is split into equal segments. Requests are counted against
//! the current segment; when time moves past a segment boundary the oldest
//! segment's count is released. This refills more smoothly than resetting a
//! single fixed window.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub struct SlidingWindowLimiter {
    permit_limit: usize,
    segment: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    counts: Vec<usize>,
    current: usize,
    segment_start: Instant,
}

impl WindowState {
    fn advance(&mut self, now: Instant, segment: Duration) {
        let elapsed = now.saturating_duration_since(self.segment_start);
        let steps = (elapsed.as_nanos() / segment.as_nanos().max(1)) as usize;
        if steps == 0 {
            return;
        }

        if steps >= self.counts.len() {
            self.counts.iter_mut().for_each(|c| *c = 0);
            self.current = 0;
            self.segment_start = now;
            return;
        }

        for _ in 0..steps {
            self.current = (self.current + 1) % self.counts.len();
            self.counts[self.current] = 0;
            self.segment_start += segment;
        }
    }
}

impl SlidingWindowLimiter {
    /// # Arguments
    /// * `permit_limit` - Requests allowed per window
    /// * `window` - Total window length
    /// * `segments` - Number of segments the window is split into (at least 1)
    pub fn new(permit_limit: usize, window: Duration, segments: u32) -> Self {
        let segments = segments.max(1);
        Self {
            permit_limit,
            segment: window / segments,
            state: Mutex::new(WindowState {
                counts: vec![0; segments as usize],
                current: 0,
                segment_start: Instant::now(),
            }),
        }
    }

    /// Take a permit now, or report how long until the next segment boundary
    fn try_acquire(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        state.advance(now, self.segment);

        let used: usize = state.counts.iter().sum();
        if used < self.permit_limit {
            let current = state.current;
            state.counts[current] += 1;
            Ok(())
        } else {
            Err((state.segment_start + self.segment).saturating_duration_since(now))
        }
    }

    /// Wait until a permit is available and take it
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit window full");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Permits still available in the current window
    pub fn available(&self) -> usize {
        let mut state = self.state.lock();
        state.advance(Instant::now(), self.segment);
        self.permit_limit
            .saturating_sub(state.counts.iter().sum::<usize>())
    }
}
