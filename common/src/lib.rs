//! Utilities shared by the workspace crates.

pub mod buffer2;
pub mod log_setup;

pub use buffer2::Buffer2;
