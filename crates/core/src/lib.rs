//! Core utilities shared by the frameflow crates.
//!
//! - Error types and result aliases
//! - Logging initialization
//! - Engine configuration (TOML)
//! - Frame timing
//! - `BoundedVec`, the fixed-capacity list behind each deferred-queue slot

mod bounded;
mod config;
mod error;
mod logging;
mod timer;

pub use bounded::BoundedVec;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::{FrameReport, FrameTimer};
