//! Token bucket rate limiter with runtime-updatable control state
//!
//! Tokens accrue at a constant rate up to the bucket capacity; each request
//! attempt consumes one. The control state (capacity, available tokens,
//! refill rate) can be inspected and replaced at runtime.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Outcome of a token acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    /// Tokens consumed
    Granted {
        /// Whole tokens left in the bucket
        remaining: u64,
    },
    /// Not enough tokens; retry after the given duration
    Wait(Duration),
}

impl Acquire {
    /// Whether the acquisition succeeded
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted { .. })
    }
}

/// Snapshot of the limiter control state
#[derive(Debug, Clone, Serialize)]
pub struct ControlState {
    /// Bucket capacity (burst size)
    pub capacity: u64,
    /// Tokens currently available
    pub available: f64,
    /// Refill rate, tokens per second
    pub refill_per_sec: f64,
}

struct BucketState {
    capacity: u64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec)
                .min(self.capacity as f64);
            self.last_refill = now;
        }
    }
}

/// Token bucket limiter
pub struct RateLimiter {
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity,
                tokens: capacity as f64,
                refill_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume `tokens` tokens
    pub fn try_acquire(&self, tokens: u64) -> Acquire {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill(now);

        let needed = tokens as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            Acquire::Granted {
                remaining: state.tokens as u64,
            }
        } else if state.refill_per_sec <= 0.0 {
            // No refill configured; callers poll at their sleep cap.
            Acquire::Wait(Duration::from_secs(1))
        } else {
            let deficit = needed - state.tokens;
            Acquire::Wait(Duration::from_secs_f64(deficit / state.refill_per_sec))
        }
    }

    /// Replace the limit and refill rate at runtime
    ///
    /// Available tokens are clamped to the new capacity; accrual continues
    /// from now at the new rate.
    pub fn set_rate(&self, capacity: u64, refill_per_sec: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill(now);
        state.capacity = capacity;
        state.refill_per_sec = refill_per_sec;
        state.tokens = state.tokens.min(capacity as f64);
    }

    /// Current control state
    pub fn control_state(&self) -> ControlState {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        ControlState {
            capacity: state.capacity,
            available: state.tokens,
            refill_per_sec: state.refill_per_sec,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.control_state();
        f.debug_struct("RateLimiter")
            .field("capacity", &state.capacity)
            .field("available", &state.available)
            .field("refill_per_sec", &state.refill_per_sec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let limiter = RateLimiter::new(2, 1.0);
        assert!(limiter.try_acquire(1).is_granted());
        assert!(limiter.try_acquire(1).is_granted());

        match limiter.try_acquire(1) {
            Acquire::Wait(wait) => assert_eq!(wait, Duration::from_secs(1)),
            Acquire::Granted { .. } => panic!("bucket should be empty"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(2, 2.0);
        assert!(limiter.try_acquire(2).is_granted());
        assert!(!limiter.try_acquire(1).is_granted());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire(1).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_capped_at_capacity() {
        let limiter = RateLimiter::new(3, 100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        let state = limiter.control_state();
        assert!(state.available <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_rate_update() {
        let limiter = RateLimiter::new(10, 1.0);
        limiter.set_rate(2, 5.0);
        let state = limiter.control_state();
        assert_eq!(state.capacity, 2);
        assert_eq!(state.refill_per_sec, 5.0);
        // Previously-banked tokens beyond the new capacity are discarded.
        assert!(state.available <= 2.0);

        assert!(limiter.try_acquire(2).is_granted());
        match limiter.try_acquire(1) {
            Acquire::Wait(wait) => assert_eq!(wait, Duration::from_millis(200)),
            Acquire::Granted { .. } => panic!("bucket should be empty"),
        }
    }
}
