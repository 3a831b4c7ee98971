//! Log at most once per interval, counting what was swallowed in between.
//!
//! Used on paths that can fail for every item or batch: an unreachable downstream, an
//! empty ring, a stream of samples with an unknown counter type.

use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct RateLimitedLogger {
    /// Queue, family or address the logged failures belong to
    scope: String,
    min_interval: Duration,
    last_log_time: Mutex<Option<Instant>>,
    /// Failures since the last emitted line
    pending: AtomicU64,
    total: AtomicU64,
}

impl RateLimitedLogger {
    pub fn new(scope: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            scope: scope.into(),
            min_interval,
            last_log_time: Mutex::new(None),
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn should_log(&self) -> bool {
        let mut last_time = self.last_log_time.lock();
        let now = Instant::now();
        match *last_time {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                *last_time = Some(now);
                true
            }
        }
    }

    /// Records one failure. Returns whether a line was emitted.
    pub fn warn(&self, what: &str, error: &dyn Display) -> bool {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.should_log() {
            return false;
        }

        let suppressed = self.pending.swap(0, Ordering::Relaxed).saturating_sub(1);
        tracing::warn!(
            scope = %self.scope,
            error = %error,
            suppressed,
            total_failures = total,
            "{what}"
        );
        true
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_is_logged() {
        let logger = RateLimitedLogger::new("10.0.0.1:6080", Duration::from_secs(60));
        assert!(logger.warn("delivery failed", &"connection refused"));
        assert!(!logger.warn("delivery failed", &"connection refused"));
        assert!(!logger.warn("delivery failed", &"connection refused"));
        assert_eq!(logger.total(), 3);
    }

    #[test]
    fn test_logs_again_after_interval() {
        let logger = RateLimitedLogger::new("archive", Duration::from_millis(10));
        assert!(logger.warn("delivery failed", &"timeout"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(logger.warn("delivery failed", &"timeout"));
    }

    #[test]
    fn test_zero_interval_always_logs() {
        let logger = RateLimitedLogger::new("report", Duration::ZERO);
        for _ in 0..5 {
            assert!(logger.warn("delivery failed", &"rejected"));
        }
    }
}
