//! Token bucket admission control for outbound edge operations.
//!
//! Every purge sent to a third-party edge provider first takes a token from a
//! shared [`TokenBucket`]. The bucket refills continuously at a fixed rate and
//! never blocks: a caller that gets `false` treats the operation as rejected.
//!
//! # Configuration Presets
//!
//! | Preset | Capacity | Refill/s |
//! |--------|----------|----------|
//! | `strict()` | 10 | 5 |
//! | `default()` | 100 | 50 |
//! | `relaxed()` | 1,000 | 500 |
//! | `disabled()` | Unlimited | - |
//!
//! # Example
//!
//! ```rust
//! use cachemesh::ratelimit::TokenBucket;
//!
//! let bucket = TokenBucket::new("purge", 2.0, 1.0).unwrap();
//! assert!(bucket.try_acquire());
//! assert!(bucket.try_acquire());
//! assert!(!bucket.try_acquire());
//! ```

use crate::error::{CacheMeshError, Result};
use crate::observability;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket can hold (burst size).
    pub capacity: f64,
    /// Tokens added per second. Zero disables refill.
    pub refill_rate_per_second: f64,
    /// Enable rate limiting.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate_per_second: 50.0,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Strict rate limiting configuration.
    pub fn strict() -> Self {
        Self {
            capacity: 10.0,
            refill_rate_per_second: 5.0,
            enabled: true,
        }
    }

    /// Relaxed rate limiting configuration.
    pub fn relaxed() -> Self {
        Self {
            capacity: 1000.0,
            refill_rate_per_second: 500.0,
            enabled: true,
        }
    }

    /// Disabled rate limiting.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "rate_limit.capacity".to_string(),
                reason: format!("must be a non-negative number, got {}", self.capacity),
            });
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second < 0.0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "rate_limit.refill_rate_per_second".to_string(),
                reason: format!(
                    "must be a non-negative number, got {}",
                    self.refill_rate_per_second
                ),
            });
        }
        Ok(())
    }
}

/// Mutable bucket state, only touched inside the refill-then-acquire section.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    /// Name for logging.
    name: String,
    /// Maximum tokens (capacity).
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Available tokens and last refill time.
    state: Mutex<BucketState>,
    /// Admitted requests.
    admitted: AtomicU64,
    /// Rejected requests.
    rejected: AtomicU64,
}

impl TokenBucket {
    /// Create a new, full token bucket.
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate: f64) -> Result<Self> {
        RateLimitConfig {
            capacity,
            refill_rate_per_second: refill_rate,
            enabled: true,
        }
        .validate()?;

        Ok(Self {
            name: name.into(),
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Create from rate limit config.
    pub fn from_config(name: impl Into<String>, config: &RateLimitConfig) -> Result<Self> {
        Self::new(name, config.capacity, config.refill_rate_per_second)
    }

    /// Name of the guarded operation class.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to acquire a token. Returns true if successful.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.admitted.fetch_add(1, Ordering::Relaxed);
            observability::record_rate_limit(&self.name, true);
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            observability::record_rate_limit(&self.name, false);
            tracing::debug!(limiter = %self.name, tokens = state.tokens, "Rate limit rejected request");
            false
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but a rejection is an error.
    pub fn acquire(&self) -> Result<()> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(CacheMeshError::RateLimitExceeded(self.name.clone()))
        }
    }

    /// Tokens currently available, including refill accrued since the last
    /// acquire. Does not mutate the bucket.
    pub fn available_tokens(&self) -> f64 {
        let state = self.state.lock();
        self.projected(&state, Instant::now())
    }

    /// Time until at least one whole token is available.
    ///
    /// Returns [`Duration::MAX`] when the bucket is empty and refill is disabled.
    pub fn time_until_next_token(&self) -> Duration {
        let available = self.available_tokens();
        if available >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(((1.0 - available) / self.refill_rate).max(0.0))
    }

    /// Snapshot of the limiter for observability.
    pub fn status(&self) -> RateLimiterStatus {
        let available_tokens = self.available_tokens();
        let wait = self.time_until_next_token();
        RateLimiterStatus {
            name: self.name.clone(),
            capacity: self.capacity,
            available_tokens,
            refill_rate_per_second: self.refill_rate,
            time_until_next_token_ms: if wait == Duration::MAX {
                None
            } else {
                Some(wait.as_millis() as u64)
            },
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn projected(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        state.tokens = self.projected(state, now).clamp(0.0, self.capacity);
        state.last_refill = now;
    }
}

/// Rate limiter status for management views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    /// Operation class the limiter guards.
    pub name: String,
    /// Bucket capacity.
    pub capacity: f64,
    /// Tokens available right now.
    pub available_tokens: f64,
    /// Refill rate.
    pub refill_rate_per_second: f64,
    /// Milliseconds until the next token; `None` if refill is disabled.
    pub time_until_next_token_ms: Option<u64>,
    /// Requests admitted so far.
    pub admitted: u64,
    /// Requests rejected so far.
    pub rejected: u64,
}
