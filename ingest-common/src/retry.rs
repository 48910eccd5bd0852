//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure job retrying.
use std::time;

#[derive(Clone, Debug)]
/// A retry policy to determine retry parameters for a job.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval for retrying at a given attempt number.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval =
            self.initial_interval * self.backoff_coefficient.pow(attempt.saturating_sub(1));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(4), time::Duration::from_secs(4));
    }
}
