//! Postgres access for the medallion warehouse: connection pool, migrations, row types and the
//! SQL behind every warehouse table.
//!
//! Functions taking a generic executor run a single statement and can be given a pool or an
//! open transaction. Multi-statement atomic units are composed by the caller in one
//! transaction.

pub mod pool;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod warehouse;

/// Schema holding every warehouse table and the migrations bookkeeping table.
pub const WAREHOUSE_SCHEMA: &str = "medallion";
