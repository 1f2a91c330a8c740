use std::future::Future;

use crate::error::EtlResult;

/// A background worker that is started once and monitored through its handle.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    type Error;

    /// Starts the worker and returns immediately with a handle to it.
    fn start(self) -> impl Future<Output = Result<H, Self::Error>> + Send;
}

/// Handle to a running worker.
pub trait WorkerHandle<S> {
    /// Returns a snapshot of the worker's state. The snapshot may be stale by the time it is
    /// inspected.
    fn state(&self) -> S;

    /// Waits for the worker to finish and returns its result.
    fn wait(self) -> impl Future<Output = EtlResult<()>> + Send;
}
