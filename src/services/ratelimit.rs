//! Per-email request interval gate
//!
//! Admits a request iff `now - last >= interval` for that email. There is no
//! global fairness; each email is tracked independently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub struct EmailRateLimiter {
    requests: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl EmailRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Check whether `email` may proceed. On admit, the request time is
    /// recorded; on reject, the remaining wait is returned.
    pub fn can_process(&self, email: &str) -> (bool, Duration) {
        let last = self.requests.read().get(email).copied();

        let now = Instant::now();
        match last {
            Some(last) if now.duration_since(last) < self.interval => {
                (false, self.interval - now.duration_since(last))
            }
            _ => {
                self.requests.write().insert(email.to_string(), now);
                (true, Duration::ZERO)
            }
        }
    }

    /// Drop entries older than twice the interval.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.interval * 2;
        self.requests
            .write()
            .retain(|_, last| now.duration_since(*last) <= horizon);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.requests.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_admitted() {
        let limiter = EmailRateLimiter::new(Duration::from_secs(60));
        let (ok, remaining) = limiter.can_process("a@x.com");
        assert!(ok);
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn test_second_request_within_interval_rejected() {
        let limiter = EmailRateLimiter::new(Duration::from_secs(60));
        assert!(limiter.can_process("a@x.com").0);

        let (ok, remaining) = limiter.can_process("a@x.com");
        assert!(!ok);
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn test_emails_tracked_independently() {
        let limiter = EmailRateLimiter::new(Duration::from_secs(60));
        assert!(limiter.can_process("a@x.com").0);
        assert!(limiter.can_process("b@x.com").0);
        assert!(!limiter.can_process("a@x.com").0);
    }

    #[test]
    fn test_request_admitted_after_interval() {
        let limiter = EmailRateLimiter::new(Duration::from_millis(10));
        assert!(limiter.can_process("a@x.com").0);
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.can_process("a@x.com").0);
    }

    #[test]
    fn test_cleanup_prunes_stale_entries() {
        let limiter = EmailRateLimiter::new(Duration::from_millis(5));
        limiter.can_process("a@x.com");
        limiter.can_process("b@x.com");
        assert_eq!(limiter.len(), 2);

        std::thread::sleep(Duration::from_millis(15));
        limiter.cleanup();
        assert_eq!(limiter.len(), 0);
    }

    #[test]
    fn test_cleanup_keeps_recent_entries() {
        let limiter = EmailRateLimiter::new(Duration::from_secs(60));
        limiter.can_process("a@x.com");
        limiter.cleanup();
        assert_eq!(limiter.len(), 1);
    }
}
