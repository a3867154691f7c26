use std::collections::HashMap;
use std::sync::Mutex;

/// Fixed-window counter keyed by an arbitrary caller key (defaults to
/// `client_id`). Each configured limiter owns its own map: counters are
/// never shared across routes that happen to reuse a key generator.
pub struct RateLimiter {
    window_ms: u64,
    max_requests: u32,
    windows: Mutex<HashMap<String, Window>>,
}

struct Window {
    start_ms: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

impl RateLimiter {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self { window_ms, max_requests, windows: Mutex::new(HashMap::new()) }
    }

    /// Checks and records one request for `key` at `now_ms`. Resets the
    /// window when it has fully elapsed; otherwise increments and rejects
    /// once `count` exceeds `max_requests`.
    pub fn check(&self, key: &str, now_ms: u64) -> Decision {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let window = windows.entry(key.to_string()).or_insert(Window { start_ms: now_ms, count: 0 });

        if now_ms.saturating_sub(window.start_ms) >= self.window_ms {
            window.start_ms = now_ms;
            window.count = 0;
        }

        window.count += 1;

        if window.count > self.max_requests {
            let retry_after_ms = self.window_ms.saturating_sub(now_ms.saturating_sub(window.start_ms));
            Decision { allowed: false, retry_after_ms }
        } else {
            Decision { allowed: true, retry_after_ms: 0 }
        }
    }

    /// Clears all tracked windows. Exposed for test isolation between
    /// cases that share a process-level limiter instance.
    pub fn reset(&self) {
        self.windows.lock().expect("rate limiter mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_requests_per_window() {
        let limiter = RateLimiter::new(1000, 3);
        assert!(limiter.check("client-a", 0).allowed);
        assert!(limiter.check("client-a", 10).allowed);
        assert!(limiter.check("client-a", 20).allowed);
        let decision = limiter.check("client-a", 30);
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms > 0);
    }

    #[test]
    fn window_resets_after_elapsed_ms() {
        let limiter = RateLimiter::new(1000, 1);
        assert!(limiter.check("client-a", 0).allowed);
        assert!(!limiter.check("client-a", 500).allowed);
        assert!(limiter.check("client-a", 1000).allowed);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = RateLimiter::new(1000, 1);
        assert!(limiter.check("client-a", 0).allowed);
        assert!(limiter.check("client-b", 0).allowed);
    }

    #[test]
    fn reset_clears_all_windows() {
        let limiter = RateLimiter::new(1000, 1);
        limiter.check("client-a", 0);
        assert!(!limiter.check("client-a", 10).allowed);
        limiter.reset();
        assert!(limiter.check("client-a", 20).allowed);
    }
}
