//! Bounded exponential backoff with jitter over a caller-supplied async
//! operation. The harness itself owns the sleep/re-invoke loop rather than
//! handing an interval back to the caller to act on.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, warn};

use crate::error::Retryable;

/// Backoff parameters: `delay(attempt) = min(cap, base * coefficient^(attempt-1)) * (1 ± jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    /// Fractional jitter applied symmetrically, e.g. `0.1` for ±10%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn build(max_attempts: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// The callback transport's policy: up to 5 attempts, base 500ms, cap 30s.
    pub fn callback_default() -> Self {
        RetryPolicy::build(5, Duration::from_millis(500))
            .maximum_interval(Duration::from_secs(30))
            .provide()
    }

    fn capped_candidate(&self, attempt: u32) -> Duration {
        let exp = self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1));
        let candidate = self.initial_interval.saturating_mul(exp);
        std::cmp::min(candidate, self.maximum_interval)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_candidate(attempt);

        if self.jitter <= 0.0 {
            return capped;
        }
        let mut rng = rand::thread_rng();
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor.max(0.0))
    }

    /// Reconciles the computed backoff with a receiver-preferred interval
    /// (e.g. a `Retry-After` header), as long as it falls within
    /// `candidate <= preferred <= maximum_interval` — used by the callback
    /// transport's 429 handling.
    pub fn reconcile_delay(&self, attempt: u32, preferred: Option<Duration>) -> Duration {
        let candidate = self.capped_candidate(attempt);
        match preferred {
            Some(duration) if candidate <= duration && duration <= self.maximum_interval => {
                duration
            }
            Some(_) | None => candidate,
        }
    }

    /// Runs `op` until it succeeds, a non-retryable error is returned, or
    /// `max_attempts` is exhausted. `op` is re-invoked from scratch on every
    /// attempt — callers are responsible for idempotent retries of the
    /// underlying operation.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let elapsed_ms = started.elapsed().as_millis();
                    if attempt >= self.max_attempts || !err.is_retryable() {
                        error!(
                            attempt,
                            elapsed_ms, error = %err, "operation failed terminally"
                        );
                        return Err(err);
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        attempt,
                        elapsed_ms,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Duration,
    jitter: f64,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..Self::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom(bool);

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl Retryable for Boom {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = RetryPolicy::build(10, Duration::from_millis(500))
            .maximum_interval(Duration::from_secs(30))
            .jitter(0.0)
            .provide();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn reconcile_delay_respects_preferred_within_bounds() {
        let policy = RetryPolicy::build(5, Duration::from_millis(500))
            .maximum_interval(Duration::from_secs(30))
            .provide();
        assert_eq!(
            policy.reconcile_delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        // preferred above the cap is ignored in favor of the capped candidate.
        assert_eq!(
            policy.reconcile_delay(1, Some(Duration::from_secs(60))),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy::build(5, Duration::from_millis(1)).jitter(0.0).provide();
        let mut calls = 0;
        let result = policy
            .run(|attempt| {
                calls += 1;
                async move {
                    if attempt < 3 {
                        Err(Boom(true))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable() {
        let policy = RetryPolicy::build(5, Duration::from_millis(1)).jitter(0.0).provide();
        let mut calls = 0;
        let result: Result<(), Boom> = policy
            .run(|_attempt| {
                calls += 1;
                async move { Err(Boom(false)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let policy = RetryPolicy::build(3, Duration::from_millis(1)).jitter(0.0).provide();
        let mut calls = 0;
        let result: Result<(), Boom> = policy
            .run(|_attempt| {
                calls += 1;
                async move { Err(Boom(true)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
