//! Configuration management for recheckd.
//!
//! Supports configuration from:
//! - Command-line arguments (highest priority)
//! - Environment variables
//! - Built-in defaults (lowest priority)

mod critical;
mod settings;

pub use critical::CriticalFile;
pub use settings::Config;
