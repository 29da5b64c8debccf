use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Fixed-window request gate. Controls throughput only; a throttled request
/// never reaches the forwarder and is never metered or billed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    usage: HashMap<String, WindowUsage>,
    last_gc_window: u64,
}

#[derive(Debug, Clone)]
struct WindowUsage {
    window: u64,
    requests: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            usage: HashMap::new(),
            last_gc_window: 0,
        }
    }

    /// Admits or throttles one request for `key` at `now` (epoch seconds).
    /// The throttle error carries a retry-after hint: seconds until the
    /// current window rolls over.
    pub fn admit(&mut self, key: &str, now_epoch_secs: u64) -> Result<(), ProxyError> {
        let window_secs = self.config.window_secs.max(1);
        let window = now_epoch_secs / window_secs;

        if window != self.last_gc_window {
            // Keep only the active window's buckets. Older/future buckets are stale.
            self.usage.retain(|_, usage| usage.window == window);
            self.last_gc_window = window;
        }

        let usage = self
            .usage
            .entry(key.to_string())
            .or_insert(WindowUsage { window, requests: 0 });

        if usage.window != window {
            usage.window = window;
            usage.requests = 0;
        }

        let next_requests = usage.requests.saturating_add(1);
        if self.config.max_requests == 0 || next_requests > self.config.max_requests {
            let retry_after_secs = ((window + 1) * window_secs).saturating_sub(now_epoch_secs);
            return Err(ProxyError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            });
        }

        usage.requests = next_requests;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs,
        })
    }

    #[test]
    fn admits_up_to_limit_then_throttles() {
        let mut limiter = limiter(3, 60);
        for _ in 0..3 {
            limiter.admit("key:a", 100).unwrap();
        }
        let err = limiter.admit("key:a", 100).unwrap_err();
        match err {
            ProxyError::RateLimited { retry_after_secs } => {
                // Window [60, 120) at t=100 leaves 20s.
                assert_eq!(retry_after_secs, 20);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn window_rollover_resets_the_counter() {
        let mut limiter = limiter(1, 60);
        limiter.admit("key:a", 100).unwrap();
        assert!(limiter.admit("key:a", 119).is_err());
        limiter.admit("key:a", 120).unwrap();
    }

    #[test]
    fn keys_are_independent() {
        let mut limiter = limiter(1, 60);
        limiter.admit("key:a", 100).unwrap();
        limiter.admit("origin:10.0.0.1", 100).unwrap();
        assert!(limiter.admit("key:a", 101).is_err());
    }

    #[test]
    fn gc_drops_buckets_from_other_windows() {
        let mut limiter = limiter(10, 60);
        limiter.admit("key:a", 100).unwrap();
        limiter.admit("key:b", 180).unwrap();
        assert_eq!(limiter.usage.len(), 1);
        assert!(limiter.usage.contains_key("key:b"));
    }
}
