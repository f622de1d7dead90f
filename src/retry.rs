//! Bounded retry for network-facing operations.
//!
//! A [`RetryPolicy`] is composed explicitly at each call site: the caller
//! supplies the operation, a name for logs, and the predicate deciding which
//! errors are worth another attempt.

use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Retry for at most `timeout`, sleeping `interval` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or a
    /// retryable error arrives after `timeout` has elapsed since the first
    /// attempt. The last error is returned in the latter two cases.
    pub async fn run<T, F, Fut>(
        &self,
        op_name: &str,
        is_retryable: impl Fn(&Error) -> bool,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_retryable(&err) {
                return Err(err);
            }
            if start.elapsed() >= self.timeout {
                tracing::error!(
                    op = op_name,
                    attempts = attempt,
                    timeout_secs = self.timeout.as_secs(),
                    error = %err,
                    "giving up after retry timeout"
                );
                return Err(err);
            }
            tracing::info!(
                op = op_name,
                attempt,
                retry_in_secs = self.interval.as_secs(),
                error = %err,
                "retrying"
            );
            metrics::retry_attempts().add(1, &[KeyValue::new("op", op_name.to_string())]);
            tokio::time::sleep(self.interval).await;
            attempt += 1;
        }
    }

    /// [`RetryPolicy::run`] retrying only [`Error::is_transient`] failures.
    pub async fn run_transient<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(op_name, Error::is_transient, op).await
    }
}
