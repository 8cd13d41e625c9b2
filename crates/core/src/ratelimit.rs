//! Rate limiting and reconnect backoff (§4.7 / C7).
//!
//! Grounded in two teacher patterns: `WSRuntime`'s doubling backoff
//! (`packages/nipworker/src/ws-rust/src/runtime.rs`, `MIN_BACKOFF_MS` /
//! `MAX_BACKOFF_MS`, reset-on-progress) for `backoff_delay`, and the
//! continuous-refill token bucket idiom the cache's `Semaphore`-bounded
//! query pool gestures at, expressed here as an actual bucket since the RPC
//! layer needs real token accounting rather than a bounded worker count.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::crypto::Rng;
use crate::error::{RelayError, Result};

/// Continuously-refilling token bucket. `capacity` tokens refill uniformly
/// over `window`; `try_acquire` never blocks, `acquire` suspends until a
/// token is available.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(f64::EPSILON),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Non-suspending attempt; returns `RateLimited` if no token is
    /// available right now.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        self.refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(RelayError::RateLimited)
        }
    }

    /// Suspends the caller until a token is available, polling at a
    /// sub-window interval. Used where back-pressure rather than rejection
    /// is wanted (e.g. bulk cache queries).
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().is_ok() {
                return;
            }
            let wait = Duration::from_secs_f64((1.0 / self.refill_per_sec).max(0.001));
            tokio::time::sleep(wait.min(Duration::from_millis(50))).await;
        }
    }
}

/// `delay(attempt) = min(base * 2^attempt, max) + uniform(0, jitter)` (§4.7).
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: Duration,
    rng: &dyn Rng,
) -> Duration {
    let doubled = base
        .as_secs_f64()
        .mul_add(2f64.powi(attempt as i32), 0.0);
    let capped = doubled.min(max.as_secs_f64());
    let jitter_secs = rng.next_f64() * jitter.as_secs_f64();
    Duration::from_secs_f64(capped + jitter_secs)
}
