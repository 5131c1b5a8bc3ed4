//! Fixed-window rate limiting keyed by caller identity, guarding
//! authorization initiation against brute-forced attempts.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use smol_str::SmolStr;

use super::SecurityError;

const DEFAULT_MAX_REQUESTS: u32 = 5;
const DEFAULT_WINDOW_SECS: u64 = 300;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    /// Requests admitted per key per window
    pub max_requests: u32,
    /// Fixed window size
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

/// Admit-or-deny capability. The decision must be atomic per key; backends
/// may be in-process (see [`FixedWindowLimiter`]) or an external atomic
/// counter service for multi-instance deployments.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> Result<(), SecurityError>;
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

/// In-process fixed-window counter. The map entry guard pins the shard
/// lock, so read-reset-increment-admit is one critical section: two
/// concurrent callers can never both be admitted as the max-th request.
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: DashMap<SmolStr, Window>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> Result<(), SecurityError> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(SmolStr::from(key))
            .or_insert_with(|| Window {
                count: 0,
                started: now,
            });
        let elapsed = now.duration_since(entry.started);
        if elapsed >= self.config.window {
            entry.count = 0;
            entry.started = now;
        }
        if entry.count < self.config.max_requests {
            entry.count += 1;
            Ok(())
        } else {
            Err(SecurityError::RateLimited {
                key: key.into(),
                retry_after: self.config.window.saturating_sub(elapsed),
            })
        }
    }
}
