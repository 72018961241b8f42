//! Reconnect delay policy for the listen loop.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on any single retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// Exponential backoff: `min(2^retries * 250ms, 10s)`.
///
/// One instance lives for the whole listen loop so sustained failures keep
/// climbing toward the ceiling. [`Backoff::reset`] is called when a session
/// reaches Ready, so a later failure starts again from the minimum.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    retries: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive failures recorded so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay for the next attempt; records one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for(self.retries);
        self.retries = self.retries.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

/// Delay after `retries` previous failures.
pub fn delay_for(retries: u32) -> Duration {
    // 2^6 * 250ms already exceeds the ceiling; clamp the shift to stay in range.
    let factor = 1u64 << retries.min(16);
    let millis = (BASE_DELAY.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_caps_at_ten_seconds() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..9)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![250, 500, 1000, 2000, 4000, 8000, 10_000, 10_000, 10_000]
        );
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..64 {
            let next = backoff.next_delay();
            assert!(next >= last);
            assert!(next <= MAX_DELAY);
            last = next;
        }
    }

    #[test]
    fn test_reset_after_ready_returns_to_minimum() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.retries(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), BASE_DELAY);
    }

    #[test]
    fn test_huge_retry_count_does_not_overflow() {
        assert_eq!(delay_for(u32::MAX), MAX_DELAY);
    }
}
