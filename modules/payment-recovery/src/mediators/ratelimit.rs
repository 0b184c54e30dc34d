//! Token-bucket rate limiter shielding downstream components from webhook
//! bursts (§4.3 defaults: 100 req/s, burst 200). Admission is a suspension
//! point per §5 and must observe the cancel token; callers that don't want
//! to wait can use [`TokenBucket::try_acquire`] directly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single-bucket token-bucket limiter. One instance per mediator, shared
/// across all webhook-handling tasks for that provider.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(refill_per_sec: u32, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            refill_per_sec: refill_per_sec as f64,
            state: Mutex::new(BucketState { tokens: burst as f64, last_refill: Instant::now() }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Take one token without blocking. Returns `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, honoring `cancel`.
    pub async fn acquire(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<(), crate::error::MediatorError> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(crate::error::MediatorError::RateLimited),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_capacity_is_consumable_immediately() {
        let bucket = TokenBucket::new(100, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(1000, 1);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.try_acquire());
    }
}
