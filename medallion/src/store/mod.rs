//! Durable state of the pipeline.
//!
//! The consumer owns the [`cursor::CursorStore`]. Every later stage reads and writes the
//! warehouse through the traits in [`warehouse`], each mutation being one atomic unit that
//! carries the data together with the position (loaded set, watermark, snapshot marker) it
//! gates.

pub mod cursor;
pub mod file;
pub mod memory;
pub mod postgres;
pub mod warehouse;
