//! Per-category token bucket rate limiting.
//!
//! Each request category ("read", "write", "login", ...) owns an independent
//! budget; categories without an explicit budget inherit the session default.
//! Refill is computed lazily at check time, so an idle limiter costs nothing.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Ceiling for a single blocking wait; the loop re-checks after each sleep.
const MAX_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("category '{0}' is disabled (rate_per_minute = 0)")]
    CategoryDisabled(String),
}

/// Budget parameters for one category.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct BudgetConfig {
    pub rate_per_minute: u32,
    pub burst_size: u32,
}

impl BudgetConfig {
    pub fn new(rate_per_minute: u32, burst_size: u32) -> Self {
        Self {
            rate_per_minute,
            burst_size,
        }
    }

    /// A zero rate means the category always denies.
    pub fn is_disabled(&self) -> bool {
        self.rate_per_minute == 0
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.rate_per_minute) / 60.0
    }
}

#[derive(Debug)]
struct TokenBucket {
    config: BudgetConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            tokens: f64::from(config.burst_size),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        // A frozen bucket carries a refill anchor in the future; leave it
        // untouched until the hold expires.
        if now < self.last_refill {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.refill_per_sec())
            .min(f64::from(self.config.burst_size));
        self.last_refill = now;
    }

    /// Take one token, or report how long until one becomes available.
    fn take_or_wait(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let rate = self.config.refill_per_sec().max(0.001);
        let wait = Duration::from_secs_f64((1.0 - self.tokens) / rate);
        Err(wait.min(MAX_SLEEP))
    }

    fn freeze(&mut self, duration: Duration) {
        self.tokens = 0.0;
        self.last_refill = Instant::now() + duration;
    }
}

#[derive(Debug)]
struct LimiterState {
    default: BudgetConfig,
    overrides: HashMap<String, BudgetConfig>,
    buckets: HashMap<String, TokenBucket>,
}

impl LimiterState {
    fn bucket_mut(&mut self, category: &str) -> &mut TokenBucket {
        let config = self
            .overrides
            .get(category)
            .copied()
            .unwrap_or(self.default);
        self.buckets
            .entry(category.to_string())
            .or_insert_with(|| TokenBucket::new(config))
    }
}

/// Token bucket limiter shared across concurrent callers.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(default: BudgetConfig) -> Self {
        Self::with_overrides(default, HashMap::new())
    }

    /// Construct with per-category budgets already in place.
    pub fn with_overrides(default: BudgetConfig, overrides: HashMap<String, BudgetConfig>) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                default,
                overrides,
                buckets: HashMap::new(),
            }),
        }
    }

    /// Register an explicit budget for a category. Replaces any bucket the
    /// category had already accumulated.
    pub async fn set_category(&self, category: impl Into<String>, config: BudgetConfig) {
        let category = category.into();
        let mut state = self.state.lock().await;
        state.buckets.remove(&category);
        state.overrides.insert(category, config);
    }

    /// Non-blocking acquisition. Disabled categories always deny.
    pub async fn try_acquire(&self, category: &str) -> bool {
        let mut state = self.state.lock().await;
        let bucket = state.bucket_mut(category);
        if bucket.config.is_disabled() {
            return false;
        }
        bucket.take_or_wait(Instant::now()).is_ok()
    }

    /// Block until a token is available, sleeping the minimal computed wait.
    ///
    /// The sleep happens outside the lock so other categories keep flowing.
    /// Cancellation while sleeping consumes nothing.
    pub async fn acquire(&self, category: &str) -> Result<(), RateLimitError> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let bucket = state.bucket_mut(category);
                if bucket.config.is_disabled() {
                    return Err(RateLimitError::CategoryDisabled(category.to_string()));
                }
                match bucket.take_or_wait(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };
            sleep(wait).await;
        }
    }

    /// Empty a category's bucket and hold refill for `duration`. Used for
    /// externally mandated cool-downs (e.g. a Retry-After directive).
    pub async fn freeze(&self, category: &str, duration: Duration) {
        let mut state = self.state.lock().await;
        state.bucket_mut(category).freeze(duration);
    }

    /// Remaining tokens for introspection; creates the bucket if new.
    pub async fn tokens(&self, category: &str) -> f64 {
        let mut state = self.state.lock().await;
        let bucket = state.bucket_mut(category);
        bucket.refill(Instant::now());
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_deny() {
        let limiter = RateLimiter::new(BudgetConfig::new(60, 3));
        assert!(limiter.try_acquire("read").await);
        assert!(limiter.try_acquire("read").await);
        assert!(limiter.try_acquire("read").await);
        // Burst exhausted, no meaningful time has passed.
        assert!(!limiter.try_acquire("read").await);
    }

    #[tokio::test]
    async fn zero_elapsed_never_overspends_burst() {
        let limiter = RateLimiter::new(BudgetConfig::new(600, 1));
        assert!(limiter.try_acquire("read").await);
        assert!(!limiter.try_acquire("read").await);
    }

    #[tokio::test]
    async fn categories_are_independent() {
        let limiter = RateLimiter::new(BudgetConfig::new(60, 1));
        assert!(limiter.try_acquire("read").await);
        assert!(limiter.try_acquire("write").await);
        assert!(!limiter.try_acquire("read").await);
    }

    #[tokio::test]
    async fn disabled_category_denies_and_errors() {
        let limiter = RateLimiter::new(BudgetConfig::new(60, 5));
        limiter.set_category("login", BudgetConfig::new(0, 0)).await;
        assert!(!limiter.try_acquire("login").await);
        assert_eq!(
            limiter.acquire("login").await,
            Err(RateLimitError::CategoryDisabled("login".into()))
        );
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // 600/min = 10 tokens/sec, so the wait after a burst is ~100ms.
        let limiter = RateLimiter::new(BudgetConfig::new(600, 1));
        assert!(limiter.try_acquire("read").await);

        let started = Instant::now();
        limiter.acquire("read").await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    }

    #[tokio::test]
    async fn freeze_empties_bucket() {
        let limiter = RateLimiter::new(BudgetConfig::new(600, 5));
        limiter.freeze("read", Duration::from_secs(30)).await;
        assert!(!limiter.try_acquire("read").await);
        assert!(limiter.tokens("read").await < 1.0);
    }

    #[tokio::test]
    async fn tokens_never_exceed_burst() {
        let limiter = RateLimiter::new(BudgetConfig::new(6000, 4));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.tokens("read").await <= 4.0);
    }
}
