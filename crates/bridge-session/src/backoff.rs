//! Exponential backoff for reconnection delays
//!
//! Deterministic doubling from the initial delay up to a ceiling; the
//! delay resets to the initial value on a successful connection.

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Create a calculator starting at `initial`, capped at `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to sleep before the next attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut b = Backoff::new(secs(1), secs(30));
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_sequence_is_non_decreasing() {
        let mut b = Backoff::new(secs(1), secs(30));
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = b.next_delay();
            assert!(delay >= previous);
            assert!(delay <= secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut b = Backoff::new(secs(1), secs(30));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.next_delay(), secs(1));
        assert_eq!(b.next_delay(), secs(2));
    }

    #[test]
    fn test_initial_above_ceiling_is_clamped() {
        let mut b = Backoff::new(secs(60), secs(30));
        assert_eq!(b.next_delay(), secs(30));
    }
}
