//! Reconnect backoff
//!
//! Exponential growth from a base delay up to a cap, with a small random
//! jitter so a fleet of agents does not reconnect in lockstep after a
//! server restart.

use std::time::Duration;

use rand::Rng;

/// Jitter range applied to each delay, as a fraction of the raw value.
const JITTER_FACTOR: f64 = 0.2;

/// Exponent is clamped so the arithmetic never overflows even after
/// days of failed attempts.
const MAX_EXPONENT: u32 = 16;

/// Tracks consecutive failed connection attempts and produces the delay
/// before the next one.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Number of consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt without jitter: `base * 2^attempt`,
    /// clamped to the cap.
    fn raw_delay(&self) -> Duration {
        let exp = self.attempt.min(MAX_EXPONENT);
        self.base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        raw.mul_f64(1.0 + jitter)
    }

    /// Forget the failure history after a connection proved stable.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn test_delays_grow_exponentially_to_the_cap() {
        let mut b = backoff();
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(b.raw_delay(), Duration::from_secs(*secs), "attempt {}", i);
            b.next_delay();
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut b = backoff();
        b.attempt = 3; // raw delay of 8s
        for _ in 0..100 {
            let delay = b.next_delay();
            assert!(delay >= Duration::from_secs_f64(8.0 * 0.8));
            assert!(delay <= Duration::from_secs_f64(8.0 * 1.2));
            b.attempt = 3;
        }
    }

    #[test]
    fn test_reset_restarts_from_base() {
        let mut b = backoff();
        for _ in 0..10 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.raw_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let mut b = backoff();
        b.attempt = u32::MAX - 1;
        let delay = b.next_delay();
        assert!(delay <= Duration::from_secs_f64(60.0 * 1.2));
        assert_eq!(b.attempt(), u32::MAX);
    }
}
