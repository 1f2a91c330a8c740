//! Durable storage of staged batches.

mod base;
pub mod file;
pub mod memory;

pub use base::{PutOutcome, StagingStore};
