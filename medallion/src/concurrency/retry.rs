//! Deadlines and bounded retries for blocking operations.

use std::future::Future;
use std::time::Duration;

use medallion_config::shared::RetryConfig;
use rand::Rng;
use tracing::{debug, warn};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested, shutdown_requested};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{MEDALLION_RETRY_ATTEMPTS_TOTAL, OPERATION_LABEL};
use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Runs `future` and fails with [`ErrorKind::DeadlineExceeded`] if it does not finish in time.
///
/// The future is dropped on expiry, so any uncommitted work it holds is rolled back.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    deadline: Duration,
    future: F,
) -> EtlResult<T>
where
    F: Future<Output = EtlResult<T>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(etl_error!(
            ErrorKind::DeadlineExceeded,
            "Operation exceeded its deadline",
            format!("`{operation}` did not complete within {deadline:?}")
        )),
    }
}

/// Executes operations with a deadline per attempt and exponential backoff between attempts.
///
/// Only errors classified as [`RetryDirective::Timed`] are retried. When the configured number
/// of attempts is exhausted the last error is wrapped in [`ErrorKind::RetriesExhausted`].
/// A shutdown request interrupts the backoff with [`ErrorKind::OperationCanceled`].
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
    deadline: Duration,
    shutdown_rx: ShutdownRx,
}

impl Retrier {
    pub fn new(config: RetryConfig, deadline: Duration, shutdown_rx: ShutdownRx) -> Self {
        Self {
            config,
            deadline,
            shutdown_rx,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut make_attempt: F) -> EtlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EtlResult<T>>,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut attempt = 1;

        loop {
            if is_shutdown_requested(&shutdown_rx) {
                return Err(canceled(operation, attempt));
            }

            let err = match with_deadline(operation, self.deadline, make_attempt()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if build_error_handling_policy(&err).retry_directive() != RetryDirective::Timed {
                return Err(err);
            }

            if attempt >= self.config.max_attempts {
                return Err(retries_exhausted(operation, attempt, err));
            }

            let delay = backoff_delay(&self.config, attempt);
            metrics::counter!(MEDALLION_RETRY_ATTEMPTS_TOTAL, OPERATION_LABEL => operation)
                .increment(1);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?err.kind(),
                "transient failure, retrying"
            );

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown_rx) => {
                    return Err(canceled(operation, attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

/// Delay after `attempt` failures: the configured backoff plus up to 25% random jitter, never
/// above the configured maximum.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_for_attempt(attempt);
    let jitter_ms = (base.as_millis() as u64) / 4;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };

    let delay = base + Duration::from_millis(jitter);
    let capped = delay.min(config.max_delay());
    debug!(attempt, delay_ms = capped.as_millis() as u64, "computed backoff delay");

    capped
}

/// Escalates the last transient error of an operation that ran out of attempts.
pub(crate) fn retries_exhausted(operation: &'static str, attempts: u32, err: EtlError) -> EtlError {
    warn!(operation, attempts, error = %err, "retries exhausted");

    etl_error!(
        ErrorKind::RetriesExhausted,
        "Retries exhausted",
        format!(
            "`{operation}` failed {attempts} times, last error: [{:?}] {}",
            err.kind(),
            err.detail().unwrap_or("no detail")
        ),
        source: err
    )
}

fn canceled(operation: &'static str, attempt: u32) -> EtlError {
    etl_error!(
        ErrorKind::OperationCanceled,
        "Operation canceled",
        format!("`{operation}` was canceled by shutdown before attempt {attempt} completed")
    )
}
