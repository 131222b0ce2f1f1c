//! Per-client token bucket rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, ScoutError};

/// Buckets untouched for this long are dropped on the next sweep.
const BUCKET_IDLE: Duration = Duration::from_secs(3600);
/// Minimum spacing between sweeps; the sweep itself rides on request
/// traffic rather than a background task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct LimiterState {
    buckets: HashMap<String, Bucket>,
    last_sweep: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// `per_minute == 0` disables the limiter entirely.
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst.max(1)),
            refill_per_sec: f64::from(per_minute) / 60.0,
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.refill_per_sec > 0.0
    }

    /// Try to take one token for `key`.
    pub fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now())
    }

    /// Refill is driven by monotonic elapsed time, so wall-clock jumps
    /// neither starve nor accelerate clients.
    fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("limiter mutex poisoned");

        if now.duration_since(state.last_sweep) >= SWEEP_INTERVAL {
            let before = state.buckets.len();
            state
                .buckets
                .retain(|_, b| now.duration_since(b.last_refill) < BUCKET_IDLE);
            let dropped = before - state.buckets.len();
            if dropped > 0 {
                debug!(dropped, "swept idle rate-limit buckets");
            }
            state.last_sweep = now;
        }

        let bucket = state.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = (1.0 - bucket.tokens) / self.refill_per_sec;
            Err(ScoutError::RateLimited { retry_after })
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }
}
