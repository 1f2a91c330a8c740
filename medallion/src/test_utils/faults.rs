use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::staging::{PutOutcome, StagingStore};
use crate::store::cursor::CursorStore;
use crate::types::{LoadCursor, PartitionKey};

/// A failure injected into the next call of a wrapped store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fails with a retryable error without touching the wrapped store.
    Transient,
    /// Fails with a fatal error without touching the wrapped store, as if the process died
    /// right before the write.
    CrashBeforeWrite,
    /// Performs the write, then fails with a fatal error, as if the process died right after
    /// the write became durable.
    CrashAfterWrite,
}

fn transient_error(operation: &str) -> EtlError {
    etl_error!(
        ErrorKind::TransientIoError,
        "Injected transient failure",
        format!("`{operation}` failed on purpose")
    )
}

fn crash_error(operation: &str) -> EtlError {
    etl_error!(
        ErrorKind::InvalidState,
        "Injected crash",
        format!("The process crashed during `{operation}`")
    )
}

#[derive(Debug, Default)]
struct Script {
    faults: VecDeque<Fault>,
    calls: usize,
}

impl Script {
    fn next(&mut self) -> Option<Fault> {
        self.calls += 1;
        self.faults.pop_front()
    }
}

/// Staging store that fails its next `put_if_absent` calls as scripted.
#[derive(Debug, Clone)]
pub struct FaultyStagingStore<S> {
    inner: S,
    script: Arc<Mutex<Script>>,
}

impl<S> FaultyStagingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Appends faults for the following puts. Puts without a scripted fault succeed.
    pub fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        self.script.lock().unwrap().faults.extend(faults);
    }

    /// Number of `put_if_absent` calls so far, failed ones included.
    pub fn put_calls(&self) -> usize {
        self.script.lock().unwrap().calls
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> StagingStore for FaultyStagingStore<S>
where
    S: StagingStore + Send + Sync,
{
    async fn put_if_absent(&self, name: &str, bytes: Bytes) -> EtlResult<PutOutcome> {
        let fault = self.script.lock().unwrap().next();

        match fault {
            Some(Fault::Transient) => Err(transient_error("put_if_absent")),
            Some(Fault::CrashBeforeWrite) => Err(crash_error("put_if_absent")),
            Some(Fault::CrashAfterWrite) => {
                self.inner.put_if_absent(name, bytes).await?;
                Err(crash_error("put_if_absent"))
            }
            None => self.inner.put_if_absent(name, bytes).await,
        }
    }

    async fn get(&self, name: &str) -> EtlResult<Bytes> {
        self.inner.get(name).await
    }

    async fn list(&self, prefix: &str) -> EtlResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// Cursor store that fails its next `commit_cursor` calls as scripted.
#[derive(Debug, Clone)]
pub struct FaultyCursorStore<C> {
    inner: C,
    script: Arc<Mutex<Script>>,
}

impl<C> FaultyCursorStore<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Appends faults for the following commits. Commits without a scripted fault succeed.
    pub fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        self.script.lock().unwrap().faults.extend(faults);
    }

    pub fn commit_calls(&self) -> usize {
        self.script.lock().unwrap().calls
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C> CursorStore for FaultyCursorStore<C>
where
    C: CursorStore + Send + Sync,
{
    async fn load_cursor(&self, partition_key: &PartitionKey) -> EtlResult<Option<LoadCursor>> {
        self.inner.load_cursor(partition_key).await
    }

    async fn commit_cursor(&self, cursor: LoadCursor) -> EtlResult<()> {
        let fault = self.script.lock().unwrap().next();

        match fault {
            Some(Fault::Transient) => Err(transient_error("commit_cursor")),
            Some(Fault::CrashBeforeWrite) => Err(crash_error("commit_cursor")),
            Some(Fault::CrashAfterWrite) => {
                self.inner.commit_cursor(cursor).await?;
                Err(crash_error("commit_cursor"))
            }
            None => self.inner.commit_cursor(cursor).await,
        }
    }
}
