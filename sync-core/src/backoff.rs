//! Exponential backoff with optional random jitter.
//!
//! Shared by reconnection, outbox retries, token refresh, and storage
//! contention retries. Jitter spreads out clients that all lost
//! connectivity at the same moment.

use std::time::Duration;

/// Exponential backoff schedule: `min(max, base * 2^(attempt-1)) + jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    /// Create a schedule without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of uniformly random delay to every step.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt number `attempt` (1-based), without jitter.
    ///
    /// Attempt 0 means "retry immediately".
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay before attempt number `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter.is_zero() {
            return base;
        }
        base + Duration::from_millis(random_jitter_ms(self.jitter.as_millis() as u64))
    }

    /// Upper bound for any single delay.
    pub fn max_delay(&self) -> Duration {
        self.max + self.jitter
    }
}

/// Random jitter in `0..=max_ms` milliseconds. Falls back to no jitter if
/// the OS random source is unavailable.
fn random_jitter_ms(max_ms: u64) -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % (max_ms + 1),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn attempt_zero_is_immediate() {
        assert_eq!(backoff().delay(0), Duration::ZERO);
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let b = backoff();
        assert_eq!(b.base_delay(1), Duration::from_secs(1));
        assert_eq!(b.base_delay(2), Duration::from_secs(2));
        assert_eq!(b.base_delay(3), Duration::from_secs(4));
        assert_eq!(b.base_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn delay_capped_at_max() {
        let b = backoff();
        assert_eq!(b.base_delay(6), Duration::from_secs(30));
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = backoff().with_jitter(Duration::from_millis(500));
        for _ in 0..50 {
            let d = b.delay(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2500));
        }
        assert_eq!(b.max_delay(), Duration::from_millis(30_500));
    }

    #[test]
    fn jitter_creates_variance() {
        let b = backoff().with_jitter(Duration::from_secs(5));
        let delays: Vec<Duration> = (0..20).map(|_| b.delay(3)).collect();

        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // 20 samples over 5001 jitter values; a collapse to one value is
        // practically impossible.
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "Expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }
}
