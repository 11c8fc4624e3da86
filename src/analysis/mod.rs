//! Analysis state consumed by the dispatcher.
//!
//! This module provides:
//! - Diagnostics with a total order and their display form
//! - Path/module resolution for the project root
//! - The per-module error table
//! - The recheck seam and a process-backed checker

mod checker;
mod diagnostic;
mod error_table;
mod tracker;

pub use checker::{CheckResults, Checker, CommandChecker, ReportedError};
pub use diagnostic::{instantiate_sorted, Diagnostic, DisplayedError, Location, ModuleId};
pub use error_table::ErrorTable;
pub use tracker::{ModuleTracker, ModuleUpdate};
