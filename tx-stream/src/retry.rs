//! # Retry
//!
//! Module providing a `RetryPolicy` struct to decide whether a failed batch is
//! attempted again, and how long to wait before doing so.
use std::time;

use rand::Rng;
use thiserror::Error;

/// Marks a processing failure that retrying cannot fix. A batch failing with
/// this anywhere in its error chain goes straight to the dead letter sink.
#[derive(Error, Debug)]
#[error("non-retryable processing failure: {0}")]
pub struct NonRetryable(pub String);

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub wait: time::Duration,
}

impl RetryDecision {
    fn give_up() -> Self {
        Self {
            retry: false,
            wait: time::Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
/// A retry policy to determine retry parameters for a batch.
pub struct RetryPolicy {
    /// Total number of processing attempts, including the first one.
    pub max_attempts: u32,
    /// Base unit of the backoff.
    pub initial_interval: time::Duration,
    /// Growth factor of the backoff ceiling per past attempt.
    pub backoff_coefficient: u32,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// Exclusive upper bound of the wait after `attempt` attempts:
    /// `initial_interval * backoff_coefficient^attempt`, capped by `maximum_interval`.
    pub fn backoff_ceiling(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let ceiling = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(ceiling, max_interval),
            None => ceiling,
        }
    }

    /// Decide what to do after `attempt` attempts have failed, the last one with `last_error`.
    ///
    /// The wait is drawn uniformly from `[0, backoff_ceiling(attempt))`. Callers own the
    /// random source so concurrent workers don't back off in lockstep.
    pub fn decide<R>(&self, attempt: u32, last_error: &anyhow::Error, rng: &mut R) -> RetryDecision
    where
        R: Rng,
    {
        if attempt >= self.max_attempts || is_non_retryable(last_error) {
            return RetryDecision::give_up();
        }

        let ceiling = self.backoff_ceiling(attempt);
        let ceiling_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        let wait = if ceiling_nanos == 0 {
            time::Duration::ZERO
        } else {
            time::Duration::from_nanos(rng.gen_range(0..ceiling_nanos))
        };

        RetryDecision { retry: true, wait }
    }
}

fn is_non_retryable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<NonRetryable>())
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub initial_interval: time::Duration,
    pub backoff_coefficient: u32,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: time::Duration::from_secs(1),
            backoff_coefficient: 2,
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_interval: self.initial_interval,
            backoff_coefficient: self.backoff_coefficient,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use test_case::test_case;

    fn transient() -> anyhow::Error {
        anyhow::anyhow!("connection reset")
    }

    #[test_case(1, 2 ; "after first attempt")]
    #[test_case(2, 4 ; "after second attempt")]
    #[test_case(3, 8 ; "after third attempt")]
    #[test_case(4, 16 ; "after fourth attempt")]
    fn test_backoff_stays_below_power_of_two(attempt: u32, ceiling_units: u64) {
        let policy = RetryPolicy::build(10, time::Duration::from_secs(1)).provide();
        let mut rng = StdRng::seed_from_u64(u64::from(attempt));

        assert_eq!(
            policy.backoff_ceiling(attempt),
            time::Duration::from_secs(ceiling_units)
        );

        for _ in 0..1000 {
            let decision = policy.decide(attempt, &transient(), &mut rng);
            assert!(decision.retry);
            assert!(decision.wait < time::Duration::from_secs(ceiling_units));
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        assert!(policy.decide(1, &transient(), &mut rng).retry);
        assert!(policy.decide(2, &transient(), &mut rng).retry);

        let decision = policy.decide(3, &transient(), &mut rng);
        assert!(!decision.retry);
        assert_eq!(decision.wait, time::Duration::ZERO);
    }

    #[test]
    fn test_non_retryable_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let error = anyhow::Error::new(NonRetryable("schema mismatch".to_string()))
            .context("failed to store transactions");

        assert!(!policy.decide(1, &error, &mut rng).retry);
    }

    #[test]
    fn test_backoff_never_exceeds_maximum() {
        let policy = RetryPolicy::build(10, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5))
            .provide();

        assert_eq!(policy.backoff_ceiling(1), time::Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(2), time::Duration::from_secs(4));
        assert_eq!(policy.backoff_ceiling(3), time::Duration::from_secs(5));
        assert_eq!(policy.backoff_ceiling(30), time::Duration::from_secs(5));
    }

    #[test]
    fn test_independent_seeds_spread_waits() {
        let policy = RetryPolicy::default();
        let mut first = StdRng::seed_from_u64(1);
        let mut second = StdRng::seed_from_u64(2);

        let waits_first: Vec<_> = (0..5)
            .map(|_| policy.decide(2, &transient(), &mut first).wait)
            .collect();
        let waits_second: Vec<_> = (0..5)
            .map(|_| policy.decide(2, &transient(), &mut second).wait)
            .collect();

        assert_ne!(waits_first, waits_second);
    }

    #[test]
    fn test_zero_interval_never_waits() {
        let policy = RetryPolicy::build(3, time::Duration::ZERO).provide();
        let mut rng = StdRng::seed_from_u64(3);

        let decision = policy.decide(1, &transient(), &mut rng);
        assert!(decision.retry);
        assert_eq!(decision.wait, time::Duration::ZERO);
    }
}
