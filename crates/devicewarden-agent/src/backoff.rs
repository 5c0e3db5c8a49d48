use std::time::Duration;

/// Doubling retry delay for failed syncs, capped, reset by any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count one more consecutive failure and return the wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current()
    }

    /// Wait implied by the current failure streak; `base` when there is none.
    pub fn current(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << doublings)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(30), Duration::from_secs(300))
    }

    #[test]
    fn test_consecutive_failures_increase_until_cap() {
        let mut backoff = backoff();
        let delays: Vec<u64> = (0..6).map(|_| backoff.record_failure().as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 300, 300]);
        assert_eq!(backoff.failures(), 6);
    }

    #[test]
    fn test_success_resets_to_base() {
        let mut backoff = backoff();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.current(), Duration::from_secs(30));
        assert_eq!(backoff.record_failure(), Duration::from_secs(30));
    }

    #[test]
    fn test_long_streak_does_not_overflow() {
        let mut backoff = backoff();
        for _ in 0..100 {
            backoff.record_failure();
        }
        assert_eq!(backoff.current(), Duration::from_secs(300));
    }
}
