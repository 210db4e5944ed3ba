use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Sliding window limiter kept in process memory, keyed by `action:user`.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    hits: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl SlidingWindowLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { hits: Arc::new(DashMap::new()), enabled }
    }

    /// Records a hit and returns true, or returns false once `limit` hits
    /// already fall inside `window`.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        while let Some(oldest) = entry.front() {
            if now.duration_since(*oldest) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() >= limit {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[derive(Clone, Debug)]
pub struct Limit {
    pub max: usize,
    pub window: Duration,
}

/// Per-action limits, read from `RL_*` variables.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub comment: Limit,
    pub like: Limit,
    pub upload: Limit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            comment: Limit { max: 10, window: Duration::from_secs(60) },
            like: Limit { max: 60, window: Duration::from_secs(60) },
            upload: Limit { max: 20, window: Duration::from_secs(3600) },
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn secs_env(name: &str, default: Duration) -> Duration {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(default)
        }
        let d = Self::default();
        Self {
            enabled: std::env::var("RL_ENABLED").map(|v| v != "0" && v != "false").unwrap_or(d.enabled),
            comment: Limit { max: usize_env("RL_COMMENT_LIMIT", d.comment.max), window: secs_env("RL_COMMENT_WINDOW", d.comment.window) },
            like: Limit { max: usize_env("RL_LIKE_LIMIT", d.like.max), window: secs_env("RL_LIKE_WINDOW", d.like.window) },
            upload: Limit { max: usize_env("RL_UPLOAD_LIMIT", d.upload.max), window: secs_env("RL_UPLOAD_WINDOW", d.upload.window) },
        }
    }
}

/// What handlers ask before doing rate limited work.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: SlidingWindowLimiter,
    cfg: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self { limiter: SlidingWindowLimiter::new(cfg.enabled), cfg }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig { enabled: false, ..RateLimitConfig::default() })
    }

    fn allow(&self, action: &str, user_id: &str, limit: &Limit) -> bool {
        self.limiter.check(&format!("{action}:{user_id}"), limit.max, limit.window)
    }

    pub fn allow_comment(&self, user_id: &str) -> bool { self.allow("comment", user_id, &self.cfg.comment) }
    pub fn allow_like(&self, user_id: &str) -> bool { self.allow("like", user_id, &self.cfg.like) }
    pub fn allow_upload(&self, user_id: &str) -> bool { self.allow("upload", user_id, &self.cfg.upload) }
}
