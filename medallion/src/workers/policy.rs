use crate::error::{ErrorKind, EtlError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// Retried automatically with backoff.
    Timed,
    /// Fatal for the partition or entity until an operator intervenes.
    Manual,
    /// Not a failure from the caller's point of view, or not recoverable by retrying.
    NoRetry,
}

/// How an [`EtlError`] is handled by workers and engines.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Operator-facing hint on how to resolve the error.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Classifies an error into an [`ErrorHandlingPolicy`].
pub fn build_error_handling_policy(error: &EtlError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Keep this list limited to failures expected to recover without intervention.
        ErrorKind::TransientIoError
        | ErrorKind::WarehouseConnectionFailed
        | ErrorKind::DeadlineExceeded => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        ErrorKind::DuplicateCommit => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("The operation was already applied, nothing to do."),
        ),
        ErrorKind::OperationCanceled => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("The operation was canceled by shutdown and can be run again safely."),
        ),

        ErrorKind::OffsetGap => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "Resume the merge from the stored watermark, or reload the skipped raw records before advancing.",
            ),
        ),
        ErrorKind::NonMonotonicOffset => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Check the change event source, offsets must strictly increase per partition."),
        ),
        ErrorKind::SnapshotOutOfOrder => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Snapshot with an as-of timestamp later than the previous snapshot of the entity."),
        ),
        ErrorKind::RetriesExhausted => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Verify the availability of the staging store and the warehouse, then rerun."),
        ),
        ErrorKind::LeaseUnavailable => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Another operation holds the lease, wait for it to finish or for the lease to expire."),
        ),
        ErrorKind::DeserializationError => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("A stored payload could not be decoded, inspect and repair it before rerunning."),
        ),
        ErrorKind::ConfigError => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Fix the configuration and restart."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::InjectedTransientFailure => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::InjectedFailure => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "There is no single prescribed solution for this error. Inspect the detail and rerun the stage once the cause is fixed.",
            ),
        ),
    }
}
