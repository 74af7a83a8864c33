//! Fixed-delay retry policy shared by the InfluxDB queries and the broker connection

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{MAX_ATTEMPTS, RETRY_DELAY};

/// Returned once every attempt has failed
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct RetryError<E: std::error::Error> {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub last_error: E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `attempt` until it succeeds or `max_attempts` is reached.
    ///
    /// The closure receives the 1-based attempt number. Attempts are separated
    /// by `delay`; there is no sleep after the last failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => {
                    if n > 1 {
                        debug!("{} succeeded on attempt {}/{}", operation, n, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if n >= max_attempts => {
                    warn!("{} failed (attempt {}/{}): {}", operation, n, max_attempts, e);
                    return Err(RetryError {
                        operation: operation.to_string(),
                        attempts: n,
                        last_error: e,
                    });
                }
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", operation, n, max_attempts, e);
                    tokio::time::sleep(self.delay).await;
                    n += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    #[error("boom #{0}")]
    struct Boom(u32);

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_exactly_max_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<(), _> = policy
            .run("flaky op", |n| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Boom(n))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 5);
        assert_eq!(err.last_error.0, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 4 gaps between 5 attempts
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert!(err.to_string().contains("flaky op failed after 5 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_separated_by_delay() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let start = Instant::now();
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let _: Result<(), _> = policy
            .run("timed op", |n| {
                let stamps = stamps.clone();
                async move {
                    stamps.lock().unwrap().push(start.elapsed());
                    Err(Boom(n))
                }
            })
            .await;

        assert_eq!(
            *stamps.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_first_success() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let value = policy
            .run("eventually ok", |n| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(Boom(n))
                    } else {
                        Ok(42.5)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42.5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
