//! Long-running workers and the error policy they share with the stage engines.

pub mod base;
pub mod consumer;
pub mod policy;
