// rust/rv-core/src/poll.rs

//! Bounded poll-with-sleep primitive.
//!
//! The shared record store has no notification mechanism, so every wait in
//! the rendezvous protocol is a fixed-interval poll with an explicit deadline.
//! There is no backoff: waits are bounded and each check is a cheap file stat.

use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;

/// Fixed-interval polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between checks.
    pub interval: Duration,
    /// Total time budget, measured from the first check.
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Upper bound on the number of checks this policy can issue.
    pub fn max_checks(&self) -> u64 {
        if self.interval.is_zero() {
            return 1;
        }
        let full = self.timeout.as_nanos() / self.interval.as_nanos();
        // initial check + one per full interval + the deadline check
        (full as u64).saturating_add(2)
    }
}

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value.
    Ready { value: T, waited: Duration },
    /// The deadline passed without a value.
    TimedOut { waited: Duration },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn waited(&self) -> Duration {
        match self {
            Self::Ready { waited, .. } | Self::TimedOut { waited } => *waited,
        }
    }

    /// Converts to an `Option`, discarding timing information.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Ready { value, .. } => Some(value),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Runs `check` until it yields `Some`, or until `policy.timeout` elapses.
///
/// The check runs once immediately, after every sleep of
/// `min(interval, remaining)`, and a final time at the deadline, so a value
/// that appears before the deadline is always observed. Check errors are
/// returned as-is without further retries.
pub fn poll_until<T, F>(clock: &dyn Clock, policy: &PollPolicy, mut check: F) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = clock.now();

    loop {
        if let Some(value) = check()? {
            return Ok(PollOutcome::Ready {
                value,
                waited: clock.since(start),
            });
        }

        let waited = clock.since(start);
        if waited >= policy.timeout {
            return Ok(PollOutcome::TimedOut { waited });
        }

        let remaining = policy.timeout - waited;
        clock.sleep(policy.interval.min(remaining).max(Duration::from_millis(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RvError;

    fn policy(interval_secs: u64, timeout_secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(timeout_secs),
        )
    }

    #[test]
    fn test_ready_immediately() {
        let clock = ManualClock::new();
        let outcome = poll_until(&clock, &policy(2, 120), || Ok(Some(7))).unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Ready {
                value: 7,
                waited: Duration::ZERO
            }
        );
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_ready_after_some_checks() {
        let clock = ManualClock::new();
        let mut checks = 0;
        let outcome = poll_until(&clock, &policy(2, 120), || {
            checks += 1;
            Ok((checks == 4).then_some("addr"))
        })
        .unwrap();

        assert_eq!(outcome.waited(), Duration::from_secs(6));
        assert_eq!(outcome.into_value(), Some("addr"));
    }

    #[test]
    fn test_times_out() {
        let clock = ManualClock::new();
        let mut checks = 0u64;
        let p = policy(2, 120);
        let outcome: PollOutcome<()> = poll_until(&clock, &p, || {
            checks += 1;
            Ok(None)
        })
        .unwrap();

        assert!(!outcome.is_ready());
        assert_eq!(outcome.waited(), Duration::from_secs(120));
        assert!(checks <= p.max_checks());
        assert_eq!(checks, 61);
    }

    #[test]
    fn test_final_check_at_deadline() {
        // interval does not divide the timeout; the last sleep is shortened
        let clock = ManualClock::new();
        let start = clock.now();
        let deadline = Duration::from_secs(5);
        let outcome = poll_until(&clock, &policy(2, 5), || {
            Ok((clock.since(start) >= deadline).then_some(()))
        })
        .unwrap();

        assert!(outcome.is_ready());
        assert_eq!(outcome.waited(), deadline);
    }

    #[test]
    fn test_check_error_propagates() {
        let clock = ManualClock::new();
        let result: Result<PollOutcome<()>> =
            poll_until(&clock, &policy(1, 10), || Err(RvError::config("boom")));
        assert!(result.is_err());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_zero_timeout_checks_once() {
        let clock = ManualClock::new();
        let mut checks = 0;
        let outcome: PollOutcome<()> =
            poll_until(&clock, &PollPolicy::new(Duration::from_secs(1), Duration::ZERO), || {
                checks += 1;
                Ok(None)
            })
            .unwrap();
        assert!(!outcome.is_ready());
        assert_eq!(checks, 1);
    }

    #[test]
    fn test_max_checks() {
        assert_eq!(policy(2, 120).max_checks(), 62);
        assert_eq!(PollPolicy::new(Duration::ZERO, Duration::from_secs(1)).max_checks(), 1);
    }
}
