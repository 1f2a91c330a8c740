//! Concurrency primitives shared by the pipeline stages.
//!
//! - [`shutdown`] broadcasts a cancellation request to every worker and engine. Workers stop at
//!   the next safe point; engines abandon retries and drop uncommitted work.
//! - [`retry`] runs blocking operations under a deadline and retries transient failures with
//!   capped exponential backoff, escalating to a fatal error once attempts are exhausted.
//! - [`lease`] provides exclusive, expiring leases scoped to a stage and a partition or entity,
//!   so that no two operations mutate the same cursor, watermark or dimension concurrently.
//! - [`timer`] and [`future`] are small building blocks for `tokio::select!` loops.

pub mod future;
pub mod lease;
pub mod retry;
pub mod shutdown;
pub mod timer;
