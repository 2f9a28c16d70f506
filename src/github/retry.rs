//! Bounded exponential backoff around fallible async operations.
//!
//! Classification and the backoff schedule are pure functions; the only
//! side effect, sleeping, goes through the [`Sleeper`] trait so tests can
//! observe delays without real timers.

use crate::cancel::Cancellation;
use crate::config::RetryConfig;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure: retry after an exponential backoff delay
    Backoff,
    /// Rate limited with a known reset: retry after exactly this long
    AfterWait(Duration),
    /// Do not retry
    Fatal,
}

/// Classify an error for the retry loop.
///
/// Server errors, network failures and rate limits are retryable; client
/// errors, authentication failures and data problems are not.
pub fn classify(error: &Error, now: DateTime<Utc>) -> RetryDecision {
    match error {
        Error::Http(e) => {
            if e.is_decode() || e.is_builder() || e.is_redirect() {
                RetryDecision::Fatal
            } else {
                RetryDecision::Backoff
            }
        }
        Error::Server { .. } => RetryDecision::Backoff,
        Error::RateLimited {
            reset_at: Some(reset_at),
            ..
        } => RetryDecision::AfterWait((*reset_at - now).to_std().unwrap_or(Duration::ZERO)),
        Error::RateLimited { reset_at: None, .. } => RetryDecision::Backoff,
        _ => RetryDecision::Fatal,
    }
}

/// Delay before retry number `attempt` (0-based):
/// `min(max_delay, base * 2^attempt) + jitter`, with `jitter` in `[0, base]`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let exponential = base.checked_mul(factor).unwrap_or(max);
    exponential.min(max) + jitter.min(base)
}

/// Random jitter in `[0, base]`
pub fn random_jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    Duration::from_millis(fastrand::u64(0..=base_ms))
}

/// Source of delays between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real timer backed by tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.sleeper.clone()
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn pause(&self, duration: Duration, cancel: &Cancellation) -> Result<()> {
        if duration.is_zero() {
            return cancel.check();
        }
        let sleep = self.sleeper.sleep(duration);
        cancel
            .run(async {
                sleep.await;
                Ok(())
            })
            .await
    }

    /// Run `operation` until it succeeds, fails fatally, or retries run out.
    ///
    /// `operation` receives the 0-based attempt number. `max_retries`
    /// overrides the configured ceiling for this call. Exhausting retries
    /// returns [`Error::RetriesExhausted`] wrapping the last error.
    pub async fn execute<T, F, Fut, C>(
        &self,
        mut operation: F,
        classify: C,
        max_retries: Option<u32>,
        cancel: &Cancellation,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> RetryDecision,
    {
        let max_retries = if self.config.enabled {
            max_retries.unwrap_or(self.config.max_retries)
        } else {
            0
        };
        let base = self.config.base_delay();
        let max = self.config.max_delay();

        let mut attempt = 0u32;
        loop {
            cancel.check()?;

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if matches!(error, Error::Cancelled) || cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let delay = match classify(&error) {
                RetryDecision::Fatal => return Err(error),
                RetryDecision::Backoff => backoff_delay(attempt, base, max, random_jitter(base)),
                RetryDecision::AfterWait(wait) => wait,
            };

            if attempt >= max_retries {
                if attempt == 0 {
                    return Err(error);
                }
                warn!(
                    "Giving up after {} attempts: {}",
                    attempt + 1,
                    error.log_safe()
                );
                return Err(Error::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(error),
                });
            }

            debug!(
                "Attempt {}/{} failed: {}. Retrying in {:?}",
                attempt + 1,
                max_retries + 1,
                error.log_safe(),
                delay
            );

            self.pause(delay, cancel).await?;
            attempt += 1;
        }
    }
}
