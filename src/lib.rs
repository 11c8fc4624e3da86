//! recheckd library
//!
//! File-watching and incremental recheck core for a long-running
//! code-analysis server: a watcher subscription turns file changes into
//! batches of paths, and a single dispatcher applies them to the module
//! tracker and error table and pushes the results to subscribed clients.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analysis;
pub mod config;
pub mod error;
pub mod server;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
