//! Outbound call governors: a global token bucket and an error budget.
//!
//! Both are process-wide singletons shared by every request task. The
//! upstream limit is per source address, so there is no per-character
//! isolation here.

use crate::error::{Error, Result};
use crate::models::Deadline;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket sized to the upstream's published request cap.
///
/// Tokens refill continuously at `rps`; the bucket holds at most one
/// second's worth of burst. Waiting is cooperative and gives up when the
/// caller's deadline expires.
pub struct TokenBucket {
    rps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    pub fn new(rps: u32) -> Self {
        let rps = rps.max(1) as f64;
        Self {
            rps,
            burst: rps,
            state: Mutex::new(BucketState {
                tokens: rps,
                refreshed: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until one is available or the deadline
    /// passes.
    pub async fn acquire(&self, deadline: Deadline) -> Result<()> {
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    if deadline.is_expired() || wait > deadline.remaining() {
                        return Err(Error::DeadlineExceeded);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.burst);
        state.refreshed = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rps))
        }
    }

    /// How long a caller should back off before the bucket can admit
    /// another request. Used for `Retry-After` hints.
    pub fn retry_after_hint(&self) -> Duration {
        match self.try_peek() {
            Some(wait) => wait,
            None => Duration::ZERO,
        }
    }

    fn try_peek(&self) -> Option<Duration> {
        let state = self.state.lock();
        let elapsed = Instant::now().duration_since(state.refreshed).as_secs_f64();
        let tokens = (state.tokens + elapsed * self.rps).min(self.burst);
        if tokens >= 1.0 {
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - tokens) / self.rps))
        }
    }
}

/// Sliding-window count of upstream error responses.
///
/// Once the window holds `threshold` errors, new calls fail fast until old
/// entries age out.
pub struct ErrorBudget {
    threshold: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl ErrorBudget {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1) as usize,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_error(&self) {
        let mut events = self.events.lock();
        let now = Instant::now();
        Self::prune(&mut events, now, self.window);
        events.push_back(now);
    }

    pub fn exhausted(&self) -> bool {
        let mut events = self.events.lock();
        Self::prune(&mut events, Instant::now(), self.window);
        events.len() >= self.threshold
    }

    fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = events.front() {
            if now.duration_since(*front) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_admits_burst_then_throttles() {
        let bucket = TokenBucket::new(5);
        let deadline = Deadline::after(Duration::from_secs(10));

        let start = Instant::now();
        // Burst drains instantly.
        for _ in 0..5 {
            bucket.acquire(deadline).await.unwrap();
        }
        assert_eq!(Instant::now().duration_since(start), Duration::ZERO);

        // The next five must wait roughly one token interval each.
        for _ in 0..5 {
            bucket.acquire(deadline).await.unwrap();
        }
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_respects_deadline() {
        let bucket = TokenBucket::new(1);
        let deadline = Deadline::after(Duration::from_millis(100));

        bucket.acquire(deadline).await.unwrap();
        let err = bucket.acquire(deadline).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_trips_and_drains() {
        let budget = ErrorBudget::new(3, Duration::from_secs(60));
        assert!(!budget.exhausted());

        for _ in 0..3 {
            budget.record_error();
        }
        assert!(budget.exhausted());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!budget.exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_zero_when_tokens_free() {
        let bucket = TokenBucket::new(2);
        assert_eq!(bucket.retry_after_hint(), Duration::ZERO);

        let deadline = Deadline::after(Duration::from_secs(5));
        bucket.acquire(deadline).await.unwrap();
        bucket.acquire(deadline).await.unwrap();
        assert!(bucket.retry_after_hint() > Duration::ZERO);
    }
}
