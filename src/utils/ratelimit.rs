use chrono::Utc;
use dashmap::DashMap;

/// Failed-authentication window limiter: after `max_failures` failures within
/// `window_secs`, further attempts from that IP are rejected until the window
/// rolls over. Applied to login, register and token verification.
pub struct AuthRateLimiter {
    attempts: DashMap<String, (u32, i64)>,
    max_failures: u32,
    window_secs: i64,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(6, 10 * 60)
    }

    pub fn with_limits(max_failures: u32, window_secs: i64) -> Self {
        Self {
            attempts: DashMap::new(),
            max_failures,
            window_secs,
        }
    }

    /// Whether this IP may attempt authentication right now.
    pub fn allowed(&self, ip: &str) -> bool {
        let now = Utc::now().timestamp();
        match self.attempts.get(ip) {
            Some(entry) => {
                let (count, window_start) = *entry;
                now - window_start >= self.window_secs || count < self.max_failures
            }
            None => true,
        }
    }

    pub fn record_failure(&self, ip: &str) {
        let now = Utc::now().timestamp();
        let mut entry = self.attempts.entry(ip.to_string()).or_insert((0, now));
        let (count, window_start) = *entry;
        if now - window_start >= self.window_secs {
            *entry = (1, now);
        } else {
            *entry = (count + 1, window_start);
        }
    }

    /// Successful authentication clears the counter.
    pub fn reset(&self, ip: &str) {
        self.attempts.remove(ip);
    }

    /// Drop windows that have expired. Called opportunistically.
    pub fn prune(&self) {
        let now = Utc::now().timestamp();
        self.attempts
            .retain(|_, (_, window_start)| now - *window_start < self.window_secs);
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_until_limit() {
        let limiter = AuthRateLimiter::with_limits(3, 600);
        for _ in 0..3 {
            assert!(limiter.allowed("1.2.3.4"));
            limiter.record_failure("1.2.3.4");
        }
        assert!(!limiter.allowed("1.2.3.4"));
        assert!(limiter.allowed("5.6.7.8"));
    }

    #[test]
    fn reset_clears_counter() {
        let limiter = AuthRateLimiter::with_limits(2, 600);
        limiter.record_failure("1.2.3.4");
        limiter.record_failure("1.2.3.4");
        assert!(!limiter.allowed("1.2.3.4"));
        limiter.reset("1.2.3.4");
        assert!(limiter.allowed("1.2.3.4"));
    }

    #[test]
    fn expired_window_allows_again() {
        let limiter = AuthRateLimiter::with_limits(1, 0);
        limiter.record_failure("1.2.3.4");
        // window_secs == 0 means every window is already over
        assert!(limiter.allowed("1.2.3.4"));
    }
}
