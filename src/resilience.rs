// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilience Pipeline
//!
//! Bounded retry around a fallible async operation. The operation runs at most
//! `max_retries + 1` times; failures before the last attempt are logged and
//! retried, the last failure is returned to the caller.
//!
//! With a zero base delay (the default) retries happen immediately. A positive
//! base delay enables exponential backoff capped at `max_delay`.
//!
//! The pipeline holds no per-call state, so one instance can serve any number
//! of concurrent callers, each with its own attempt counter.

use crate::{errors::BrokerResult, settings::BrokerSettings};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::{future::Future, time::Duration};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    name: String,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ResiliencePipeline {
    /// Creates a pipeline that retries immediately.
    pub fn new(name: impl Into<String>, max_retries: u32) -> Self {
        ResiliencePipeline {
            name: name.into(),
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &BrokerSettings) -> Self {
        ResiliencePipeline::new(name, settings.retry_count)
            .with_backoff(settings.retry_base_delay(), settings.retry_max_delay())
    }

    /// Enables exponential backoff starting at `base_delay`.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Runs `operation` until it succeeds or the retries are exhausted.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            pipeline = self.name.as_str(),
                            attempts = attempt + 1,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_retries => {
                    warn!(
                        pipeline = self.name.as_str(),
                        attempt = attempt + 1,
                        error = err.to_string(),
                        "operation failed, retrying"
                    );

                    if let Some(delay) = backoff.as_mut().and_then(Backoff::next_backoff) {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        pipeline = self.name.as_str(),
                        attempts = attempt + 1,
                        error = err.to_string(),
                        "operation failed, giving up"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Fresh delay schedule for one `execute` call, `None` when retries are
    /// immediate.
    fn backoff(&self) -> Option<ExponentialBackoff> {
        if self.base_delay.is_zero() {
            return None;
        }
        Some(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(self.base_delay)
                .with_max_interval(self.max_delay)
                .with_multiplier(2.0)
                .with_randomization_factor(0.0)
                .with_max_elapsed_time(None)
                .build(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BrokerError;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn failing_until(calls: &AtomicU32, successes_from: u32) -> BrokerResult<u32> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= successes_from {
            Ok(n)
        } else {
            Err(BrokerError::ConnectionError(format!("attempt {n}")))
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let pipeline = ResiliencePipeline::new("test", 3);

        let result = pipeline
            .execute(move || async move { failing_until(calls, 1) })
            .await;

        assert_eq!(result, Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let pipeline = ResiliencePipeline::new("test", 3);

        let result = pipeline
            .execute(move || async move { failing_until(calls, 3) })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn runs_max_retries_plus_one_and_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let pipeline = ResiliencePipeline::new("test", 2);

        let result = pipeline
            .execute(move || async move { failing_until(calls, u32::MAX) })
            .await;

        assert_eq!(result, Err(BrokerError::ConnectionError("attempt 3".to_owned())));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let pipeline = ResiliencePipeline::new("test", 0);

        let result = pipeline
            .execute(move || async move { failing_until(calls, u32::MAX) })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_keep_independent_counters() {
        let pipeline = Arc::new(ResiliencePipeline::new("test", 1));
        let mut tasks = vec![];

        for _ in 0..8 {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                let counter = AtomicU32::new(0);
                let calls = &counter;
                let result = pipeline
                    .execute(move || async move { failing_until(calls, 2) })
                    .await;
                (result, counter.load(Ordering::SeqCst))
            }));
        }

        for task in tasks {
            let (result, calls) = task.await.unwrap();
            assert_eq!(result, Ok(2));
            assert_eq!(calls, 2);
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let pipeline = ResiliencePipeline::new("test", 10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));

        let mut backoff = pipeline.backoff().unwrap();
        let delays: Vec<u128> = (0..6)
            .filter_map(|_| backoff.next_backoff())
            .map(|delay| delay.as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500]);
    }

    #[test]
    fn zero_base_delay_retries_immediately() {
        let pipeline = ResiliencePipeline::new("test", 3);
        assert!(pipeline.backoff().is_none());

        let pipeline =
            ResiliencePipeline::new("test", 3).with_backoff(Duration::ZERO, Duration::from_secs(1));
        assert!(pipeline.backoff().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let pipeline = ResiliencePipeline::new("test", 2)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(10));
        let started = tokio::time::Instant::now();

        let result = pipeline
            .execute(move || async move { failing_until(calls, 3) })
            .await;

        assert_eq!(result, Ok(3));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
