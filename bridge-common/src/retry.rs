//! # Retry
//!
//! Exponential backoff for redelivering tasks that failed with a transient error.
use std::time;

/// Used when the exponential interval no longer fits in a `Duration`.
const MAX_INTERVAL: time::Duration = time::Duration::from_secs(60 * 60 * 24);

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Multiplier applied to the interval after every attempt.
    pub backoff_coefficient: u32,
    /// Interval before the first retry.
    pub initial_interval: time::Duration,
    /// Upper bound for any interval, including one asked for by the target.
    pub maximum_interval: Option<time::Duration>,
    /// Queue retried tasks are moved to. Tasks stay in their queue when unset.
    pub queue: Option<String>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Interval before retrying a task that just failed its `attempt`th delivery.
    ///
    /// A `preferred` interval, usually from a `Retry-After` header, is used when it is no
    /// shorter than the backoff interval and no longer than `maximum_interval`.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred: Option<time::Duration>,
    ) -> time::Duration {
        let backoff = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(MAX_INTERVAL);

        let ceiling = self.maximum_interval.unwrap_or(time::Duration::MAX);
        let backoff = backoff.min(ceiling);

        match preferred {
            Some(interval) if interval >= backoff && interval <= ceiling => interval,
            _ => backoff,
        }
    }

    pub fn retry_queue<'s>(&'s self, current_queue: &'s str) -> &'s str {
        self.queue.as_deref().unwrap_or(current_queue)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    queue: Option<String>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            queue: None,
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

    pub fn queue(mut self, queue: &str) -> RetryPolicyBuilder {
        self.queue = Some(queue.to_owned());
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            queue: self.queue.clone(),
        }
    }
}
