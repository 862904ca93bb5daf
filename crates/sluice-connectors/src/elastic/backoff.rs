//! Full-jitter exponential backoff for bulk retries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// The delay for attempt `n` is drawn uniformly from
/// `[0, min(cap, base * 2^n)]`. Full jitter spreads retry storms across
/// workers instead of synchronizing them.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Creates a backoff policy.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the delay for the given attempt (0-based).
    #[allow(clippy::cast_possible_truncation)] // millis are clamped to u64
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.cap.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = attempt.min(32);
        let ceiling = base_ms.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        Duration::from_millis(ceiling.min(cap_ms))
    }

    /// A jittered delay for the given attempt (0-based).
    #[allow(clippy::cast_possible_truncation)] // millis are clamped to u64
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis().min(u128::from(u64::MAX)) as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl Default for Backoff {
    /// Base 1s, cap 60s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
