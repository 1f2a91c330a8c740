//! Row types and statements of the warehouse tables.

pub mod bronze;
pub mod conformed;
pub mod cursors;
pub mod dimensions;
pub mod facts;
pub mod leases;
pub mod quarantine;
