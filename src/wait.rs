//! Bounded waiting: polling a condition until a deadline, and retrying a fallible operation with
//! exponential backoff.

use crate::error::DeliveryError;
use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::Instant;

/// Poll `probe` immediately and then every `interval` until it reports ready or the next poll
/// would land past `timeout`. A probe error counts as "not ready yet".
///
/// Returns how long it took for the condition to hold.
pub(crate) async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, what: &str, mut probe: F) -> Result<Duration, DeliveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let start = Instant::now();
    let deadline = start + timeout;

    loop {
        match probe().await {
            Ok(true) => return Ok(start.elapsed()),
            Ok(false) => log::debug!("{} not ready after {:?}", what, start.elapsed()),
            Err(err) => log::warn!("{} probe failed after {:?}: {:#}", what, start.elapsed(), err),
        }

        if Instant::now() + interval > deadline {
            return Err(DeliveryError::ReadinessTimeout(timeout));
        }

        tokio::time::sleep(interval).await;
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RetryConfig {
    /// Total attempts including the first one, at least 1
    pub(crate) max_attempts: u32,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable` rejects, or
/// `max_attempts` is exhausted. Delays grow exponentially with 0.5x-1.5x jitter.
pub(crate) async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) {
                    log::error!("{} failed permanently: {}", operation_name, err);
                    return Err(err);
                }

                if attempt >= config.max_attempts.max(1) {
                    log::error!("{} failed after {} attempts: {}", operation_name, attempt, err);
                    return Err(err);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                log::warn!(
                    "{} failed (attempt {}), retrying in {}ms: {}",
                    operation_name,
                    attempt,
                    jittered_delay.as_millis(),
                    err
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64((delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()));
            }
        }
    }
}
