//! Retry policies for failed jobs.
//!
//! A [`RetryPolicy`] maps the attempt that just failed onto either the interval to wait before the
//! next attempt or the decision that the job is exhausted. Intervals are taken from an ordered
//! list in which the last value repeats.
//!
//! # Example
//!
//! ```
//! # use stevedore::prelude::*;
//! # use chrono::TimeDelta;
//! let policy = RetryPolicy::new(4, [TimeDelta::seconds(5), TimeDelta::seconds(10)]);
//!
//! assert_eq!(policy.next_interval(1), Some(TimeDelta::seconds(5)));
//! assert_eq!(policy.next_interval(2), Some(TimeDelta::seconds(10)));
//! assert_eq!(policy.next_interval(3), Some(TimeDelta::seconds(10)));
//! assert_eq!(policy.next_interval(4), None);
//! assert!(policy.is_last_attempt(4));
//! ```

use std::sync::Arc;

use chrono::TimeDelta;
use rand::Rng;

/// A random jitter to be applied to a retry interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the interval in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current interval.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .saturating_abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        TimeDelta::try_milliseconds(jitter)
            .and_then(|jitter| value.checked_add(&jitter))
            .unwrap_or(value)
            .max(TimeDelta::zero())
    }
}

/// How many times a job may be attempted and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u16,
    intervals: Arc<[TimeDelta]>,
    jitter: Option<Jitter>,
}

impl Default for RetryPolicy {
    /// Five attempts, waiting 1 minute, 5 minutes, 15 minutes, then an hour between them.
    fn default() -> Self {
        Self::new(
            5,
            [
                TimeDelta::minutes(1),
                TimeDelta::minutes(5),
                TimeDelta::minutes(15),
                TimeDelta::hours(1),
            ],
        )
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` attempts in total.
    ///
    /// An empty list of intervals retries immediately.
    pub fn new(max_attempts: u16, intervals: impl IntoIterator<Item = TimeDelta>) -> Self {
        Self {
            max_attempts,
            intervals: intervals.into_iter().collect(),
            jitter: None,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, [])
    }

    /// Add a jitter to the intervals, see [`Jitter`] for more information. Intervals never drop
    /// below zero.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    pub fn intervals(&self) -> &[TimeDelta] {
        &self.intervals
    }

    /// Whether the given attempt (starting at one) is the final one allowed.
    pub fn is_last_attempt(&self, attempt: u16) -> bool {
        attempt >= self.max_attempts
    }

    /// The interval to wait after the given attempt failed, or [`None`] when the attempts are
    /// exhausted.
    pub fn next_interval(&self, attempt: u16) -> Option<TimeDelta> {
        if self.is_last_attempt(attempt) {
            return None;
        }
        let index = usize::from(attempt.max(1) - 1).min(self.intervals.len().saturating_sub(1));
        let interval = self
            .intervals
            .get(index)
            .copied()
            .unwrap_or(TimeDelta::zero());
        Some(match self.jitter {
            Some(jitter) => jitter.apply_jitter(interval),
            None => interval,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intervals_follow_attempts_and_last_value_repeats() {
        let intervals = [
            TimeDelta::seconds(1),
            TimeDelta::seconds(2),
            TimeDelta::seconds(3),
        ];
        for max_attempts in 1..10u16 {
            let policy = RetryPolicy::new(max_attempts, intervals);
            for attempt in 1..max_attempts {
                let expected = intervals[usize::from(attempt - 1).min(intervals.len() - 1)];
                assert_eq!(policy.next_interval(attempt), Some(expected));
                assert!(!policy.is_last_attempt(attempt));
            }
            for attempt in max_attempts..max_attempts + 3 {
                assert_eq!(policy.next_interval(attempt), None);
                assert!(policy.is_last_attempt(attempt));
            }
        }
    }

    #[test]
    fn two_attempts_with_two_intervals() {
        let policy = RetryPolicy::new(2, [TimeDelta::seconds(5), TimeDelta::seconds(10)]);

        assert_eq!(policy.next_interval(1), Some(TimeDelta::seconds(5)));
        assert_eq!(policy.next_interval(2), None);
    }

    #[test]
    fn empty_intervals_retry_immediately() {
        let policy = RetryPolicy::new(3, []);

        assert_eq!(policy.next_interval(1), Some(TimeDelta::zero()));
        assert_eq!(policy.next_interval(2), Some(TimeDelta::zero()));
        assert_eq!(policy.next_interval(3), None);
    }

    #[test]
    fn no_retry_is_exhausted_after_first_attempt() {
        let policy = RetryPolicy::no_retry();

        assert!(policy.is_last_attempt(1));
        assert_eq!(policy.next_interval(1), None);
    }

    #[test]
    fn absolute_jitter_stays_in_range() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let policy = RetryPolicy::new(100, [delay]).with_jitter(Jitter::Absolute(jitter));

        for attempt in 1..100 {
            let interval = policy.next_interval(attempt).unwrap();
            assert!(interval >= delay - jitter);
            assert!(interval <= delay + jitter);
        }
    }

    #[test]
    fn relative_jitter_stays_in_range() {
        let delay = TimeDelta::minutes(1);
        let policy = RetryPolicy::new(100, [delay]).with_jitter(Jitter::Relative(0.1));

        for attempt in 1..100 {
            let interval = policy.next_interval(attempt).unwrap();
            assert!(interval >= delay - TimeDelta::seconds(6));
            assert!(interval <= delay + TimeDelta::seconds(6));
        }
    }

    #[test]
    fn jitter_never_goes_negative() {
        let policy = RetryPolicy::new(100, [TimeDelta::seconds(1)])
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(30)));

        for attempt in 1..100 {
            assert!(policy.next_interval(attempt).unwrap() >= TimeDelta::zero());
        }
    }

    #[test]
    fn extreme_jitter_keeps_the_interval_in_bounds() {
        let absolute = RetryPolicy::new(100, [TimeDelta::MAX])
            .with_jitter(Jitter::Absolute(TimeDelta::MAX));
        let relative = RetryPolicy::new(100, [TimeDelta::MAX]).with_jitter(Jitter::Relative(-f64::MAX));

        for attempt in 1..100 {
            let interval = absolute.next_interval(attempt).unwrap();
            assert!(interval >= TimeDelta::zero() && interval <= TimeDelta::MAX);
            let interval = relative.next_interval(attempt).unwrap();
            assert!(interval >= TimeDelta::zero() && interval <= TimeDelta::MAX);
        }
    }
}
