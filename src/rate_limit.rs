use dashmap::DashMap;
use reqwest::Url;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{EngineError, EngineResult};

/// Counter for one endpoint.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Sliding-window admission control, one window per upstream endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, windows: DashMap::new() }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    /// Admits one request for `endpoint_key` or fails fast with
    /// `RateLimitExceeded`. Rejected calls are not queued.
    pub fn try_admit(&self, endpoint_key: &str) -> EngineResult<()> {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(endpoint_key.to_string())
            .or_insert(RateWindow { window_start: now, count: 0 });

        if now > window.window_start + self.window {
            window.window_start = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            log::warn!(
                "Rate limit of {} per {:?} reached for {}",
                self.limit,
                self.window,
                endpoint_key
            );
            return Err(EngineError::RateLimitExceeded { endpoint: endpoint_key.to_string() });
        }

        window.count += 1;
        Ok(())
    }

    /// Requests still admissible in the current window.
    pub fn remaining(&self, endpoint_key: &str) -> u32 {
        match self.windows.get(endpoint_key) {
            Some(window) if Instant::now() <= window.window_start + self.window => {
                self.limit.saturating_sub(window.count)
            }
            _ => self.limit,
        }
    }
}

/// `{method}:{origin}{path}`, so distinct resources are limited independently.
pub fn endpoint_key(method: &str, url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => format!(
            "{}:{}{}",
            method.to_uppercase(),
            parsed.origin().ascii_serialization(),
            parsed.path()
        ),
        Err(_) => format!("{}:{}", method.to_uppercase(), url),
    }
}
