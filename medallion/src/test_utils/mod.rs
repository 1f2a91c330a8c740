//! Utilities for testing pipelines against in-memory stores and a throwaway Postgres warehouse.
//!
//! - [`event`] builds change events and timestamps.
//! - [`config`] builds pipeline configurations with short timeouts.
//! - [`faults`] wraps stores to inject transient failures and simulated crashes.
//! - [`database`] creates and drops migrated warehouse databases.
//! - [`failpoints`] configures `fail` failpoints for the duration of a test.

pub mod config;
pub mod database;
pub mod event;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod faults;
