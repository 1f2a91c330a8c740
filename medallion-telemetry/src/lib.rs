//! Tracing and metrics initialization shared by medallion binaries and tests.

pub mod metrics;
pub mod tracing;
