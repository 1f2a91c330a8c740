//! Change event sources feeding the consumers.

mod base;
pub mod file;
pub mod memory;

pub use base::ChangeEventSource;
