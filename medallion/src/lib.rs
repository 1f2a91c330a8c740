//! Change-data-capture pipeline that lands source change events in a layered warehouse.
//!
//! Events flow through five stages, each safe to re-run after a crash:
//!
//! 1. [`workers::consumer`] batches events per partition into the staging store and commits a
//!    cursor only after the batch is durable.
//! 2. [`loader`] moves staged objects into append-only raw records exactly once.
//! 3. [`merge`] folds raw records into the current state of every business key.
//! 4. [`snapshot`] historizes the current state as SCD type-2 dimension versions.
//! 5. [`facts`] upserts facts linked to the dimension versions valid at their event time.

pub mod concurrency;
pub mod error;
pub mod facts;
pub mod failpoints;
pub mod loader;
mod macros;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod snapshot;
pub mod source;
pub mod staging;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
