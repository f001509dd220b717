//! Brute-force protection for tunnel passwords
//!
//! Failures are counted per key (a subdomain, optionally combined with the
//! client address). Once a key reaches `max_attempts` consecutive failures it
//! is locked, and each further failure doubles the lockout up to `max_lockout`.
//!
//! Callers that verify credentials concurrently reserve an attempt with
//! [`RateLimiter::try_begin_attempt`] first, so unsettled attempts count
//! against the same budget as recorded failures.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Consecutive failures before the first lockout
    pub max_attempts: u32,
    /// Lockout applied when `max_attempts` is reached
    pub base_lockout: Duration,
    /// Upper bound for the exponential lockout
    pub max_lockout: Duration,
    /// Unlocked entries idle for this long are evicted by the sweep
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_lockout: Duration::from_secs(30),
            max_lockout: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Result of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Remaining lockout; zero when allowed
    pub wait_time: Duration,
}

impl RateLimitStatus {
    fn allowed() -> Self {
        Self {
            allowed: true,
            wait_time: Duration::ZERO,
        }
    }

    fn locked(wait_time: Duration) -> Self {
        Self {
            allowed: false,
            wait_time,
        }
    }
}

/// Suggested wait when every attempt slot for a key is taken
pub const BUSY_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct AttemptState {
    failures: u32,
    /// Attempts reserved but not yet settled
    in_flight: u32,
    last_attempt: Instant,
    locked_until: Option<Instant>,
}

impl AttemptState {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            in_flight: 0,
            last_attempt: now,
            locked_until: None,
        }
    }

    fn is_clear(&self) -> bool {
        self.failures == 0 && self.in_flight == 0 && self.locked_until.is_none()
    }

    fn remaining_lock(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Per-key failure tracker with exponential lockout
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: DashMap<String, AttemptState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check_rate_limit(&self, key: &str) -> RateLimitStatus {
        let now = Instant::now();
        match self.entries.get(key).and_then(|s| s.remaining_lock(now)) {
            Some(wait) => RateLimitStatus::locked(wait),
            None => RateLimitStatus::allowed(),
        }
    }

    /// Reserve one attempt for `key`
    ///
    /// Refused while the key is locked, or while recorded failures plus
    /// unsettled attempts already fill `max_attempts`. Once a key has been
    /// locked, only one attempt at a time is admitted after the lock expires.
    pub fn try_begin_attempt(&self, key: &str) -> Result<AttemptPermit<'_>, RateLimitStatus> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| AttemptState::new(now));

        if let Some(wait) = entry.remaining_lock(now) {
            return Err(RateLimitStatus::locked(wait));
        }

        let budget = self
            .config
            .max_attempts
            .saturating_sub(entry.failures)
            .max(1);
        if entry.in_flight >= budget {
            debug!(
                "Refusing attempt for '{}': {} failures, {} in flight",
                key, entry.failures, entry.in_flight
            );
            return Err(RateLimitStatus::locked(BUSY_RETRY));
        }

        entry.in_flight += 1;
        entry.last_attempt = now;
        Ok(AttemptPermit {
            limiter: self,
            key: key.to_string(),
        })
    }

    fn release(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        self.entries.remove_if(key, |_, state| state.is_clear());
    }

    /// Count a failed attempt and return the resulting status
    pub fn record_failure(&self, key: &str) -> RateLimitStatus {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| AttemptState::new(now));

        entry.failures = entry.failures.saturating_add(1);
        entry.last_attempt = now;

        if entry.failures >= self.config.max_attempts {
            let lockout = self.lockout_for(entry.failures);
            entry.locked_until = Some(now + lockout);
            info!(
                "🔒 Locking '{}' for {:?} after {} failed attempts",
                key, lockout, entry.failures
            );
            return RateLimitStatus::locked(lockout);
        }

        RateLimitStatus::allowed()
    }

    pub fn record_success(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.failures = 0;
            entry.locked_until = None;
        }
        self.entries.remove_if(key, |_, state| state.is_clear());
    }

    pub fn in_flight(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |s| s.in_flight)
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |s| s.failures)
    }

    fn lockout_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.config.max_attempts);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.config
            .base_lockout
            .checked_mul(factor)
            .map_or(self.config.max_lockout, |d| d.min(self.config.max_lockout))
    }

    /// Drop entries that are unlocked and idle; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            state.in_flight > 0
                || state.remaining_lock(now).is_some()
                || now.duration_since(state.last_attempt) < idle
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Rate limiter sweep evicted {} entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}

/// A reserved attempt; dropping it without settling just frees the slot
#[derive(Debug)]
pub struct AttemptPermit<'a> {
    limiter: &'a RateLimiter,
    key: String,
}

impl AttemptPermit<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The attempt succeeded; clears the key's failures
    pub fn succeed(self) {
        self.limiter.record_success(&self.key);
    }

    /// The attempt failed; counts it and returns the resulting status
    pub fn fail(self) -> RateLimitStatus {
        self.limiter.record_failure(&self.key)
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release(&self.key);
    }
}
