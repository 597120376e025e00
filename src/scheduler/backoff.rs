//! Retry policy for failed jobs.
//!
//! Delays grow exponentially with the attempt count: `delay(n) = base^n`
//! seconds, where `n` is the attempt count after the failure is recorded.
//! There is no jitter and no cap; the retry budget (`max_attempts`) is what
//! bounds the total delay.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Default exponential base used when configuration provides none.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending`, eligible again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Retry budget exhausted; move the job to `dead`.
    DeadLetter { attempts: u32 },
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_BASE)
    }
}

impl RetryPolicy {
    /// Creates a policy with the given exponential base.
    pub fn exponential(base: u32) -> Self {
        Self { base }
    }

    /// Returns the delay in whole seconds before retry number `attempt`.
    ///
    /// Saturates at `u64::MAX` instead of overflowing.
    pub fn delay_secs(&self, attempt: u32) -> u64 {
        u64::from(self.base)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX)
    }

    /// Returns the delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.delay_secs(attempt))
    }

    /// Decides the outcome of a failure for a job that had `attempts` failed
    /// attempts before this one.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        let attempts = attempts.saturating_add(1);
        if attempts >= max_attempts {
            RetryDecision::DeadLetter { attempts }
        } else {
            RetryDecision::Retry {
                attempts,
                delay: self.delay(attempts),
            }
        }
    }

    /// Returns when a job failing at `now` becomes eligible for retry number
    /// `attempt`.
    ///
    /// Due times beyond what the store can represent are clamped to
    /// [`far_future`].
    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        i64::try_from(self.delay_secs(attempt))
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .map(|due| due.min(far_future()))
            .unwrap_or_else(far_future)
    }
}

/// Latest instant stored as a job due time.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::exponential(2));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(2);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));

        let policy = RetryPolicy::exponential(3);
        assert_eq!(policy.delay_secs(1), 3);
        assert_eq!(policy.delay_secs(2), 9);
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::exponential(10);
        assert_eq!(policy.delay_secs(40), u64::MAX);
    }

    #[test]
    fn test_decide_retry_then_dead_letter() {
        let policy = RetryPolicy::exponential(2);

        assert_eq!(
            policy.decide(0, 3),
            RetryDecision::Retry {
                attempts: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(1, 3),
            RetryDecision::Retry {
                attempts: 2,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(policy.decide(2, 3), RetryDecision::DeadLetter { attempts: 3 });
    }

    #[test]
    fn test_single_attempt_budget_dead_letters_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, 1), RetryDecision::DeadLetter { attempts: 1 });
    }

    #[test]
    fn test_next_run_at() {
        let policy = RetryPolicy::exponential(2);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            policy.next_run_at(now, 2),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 4).unwrap()
        );
    }

    #[test]
    fn test_next_run_at_clamps_overflow() {
        let policy = RetryPolicy::exponential(u32::MAX);
        let now = Utc::now();
        assert_eq!(policy.next_run_at(now, 5), far_future());
    }
}
