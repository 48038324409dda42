//! FramePump Common Utilities
//!
//! Shared infrastructure for all FramePump crates:
//! - Error types and result aliases
//! - Timebases and pipeline deadlines
//! - Tracing/logging initialization
//! - Engine configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
