use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("Invalid or missing API key")]
    InvalidToken,

    #[error("Rate limit exceeded. Maximum {limit} requests per {window_secs} seconds.")]
    RateLimited { limit: usize, window_secs: u64 },
}

/// Sliding-window request counter keyed by caller token.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
        }
    }

    /// Record a request at `now` if the caller is under the limit.
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut hits = self.hits.entry(key.to_string()).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }
}

/// `X-API-Key` allow-list plus per-token rate limiting. With an empty
/// allow-list every request is let through unmetered.
#[derive(Debug)]
pub struct AccessControl {
    tokens: HashSet<String>,
    limiter: RateLimiter,
}

impl AccessControl {
    pub fn new(tokens: &[String], limit: usize, window: Duration) -> Self {
        Self {
            tokens: tokens.iter().cloned().collect(),
            limiter: RateLimiter::new(limit, window),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn check(&self, presented: Option<&str>) -> Result<(), AccessError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let token = presented
            .filter(|t| self.tokens.contains(*t))
            .ok_or(AccessError::InvalidToken)?;

        if self.limiter.try_acquire(token) {
            Ok(())
        } else {
            let prefix: String = token.chars().take(5).collect();
            tracing::warn!(token_prefix = %prefix, "Rate limit exceeded");
            Err(AccessError::RateLimited {
                limit: self.limiter.limit,
                window_secs: self.limiter.window.as_secs(),
            })
        }
    }
}
