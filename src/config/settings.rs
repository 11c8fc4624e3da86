//! Configuration settings and validation.

use std::path::PathBuf;

use serde::Serialize;

use super::CriticalFile;
use crate::{Error, Result};

/// Directory under the project root holding server runtime files.
const RUNTIME_DIR: &str = ".recheckd";

/// Upper bound on concurrent checker processes.
const MAX_JOBS: usize = 64;

/// Main configuration for the recheckd server.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Absolute project root watched and analyzed.
    pub root: PathBuf,

    /// Explicit client socket path; defaults under the runtime directory.
    pub socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Watcher executable used for socket discovery.
    pub watchman_binary: PathBuf,

    /// Serve without a file watcher.
    pub no_watchman: bool,

    /// Tracked file suffixes, without the leading dot.
    pub suffixes: Vec<String>,

    /// Extra exact file names the watcher reports.
    pub base_names: Vec<String>,

    /// Files whose change stops the server.
    pub critical_files: Vec<CriticalFile>,

    /// External checker program.
    pub checker_command: Option<PathBuf>,

    /// Arguments passed to the checker before the file list.
    pub checker_args: Vec<String>,

    /// Maximum number of concurrent checker processes.
    pub jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            socket_path: None,
            log_level: "info".to_string(),
            watchman_binary: PathBuf::from("watchman"),
            no_watchman: false,
            suffixes: vec!["py".to_string(), "pyi".to_string()],
            base_names: Vec::new(),
            critical_files: Vec::new(),
            checker_command: None,
            checker_args: Vec::new(),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(4),
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::config(format!(
                "root '{}' must be an absolute path",
                self.root.display()
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.suffixes.is_empty() {
            return Err(Error::config("at least one tracked suffix is required"));
        }

        if self.suffixes.iter().any(|s| s.is_empty() || s.starts_with('.')) {
            return Err(Error::config(
                "suffixes must be non-empty and given without the leading dot",
            ));
        }

        if self.jobs == 0 {
            return Err(Error::config("jobs cannot be 0"));
        }

        if self.jobs > MAX_JOBS {
            return Err(Error::config(format!("jobs cannot exceed {MAX_JOBS}")));
        }

        Ok(())
    }

    /// Directory holding the socket and notification files.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(RUNTIME_DIR)
    }

    /// Get the path of the client socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.runtime_dir().join("server.sock"))
    }

    /// Get the path of the startup notification file.
    #[must_use]
    pub fn notification_path(&self) -> PathBuf {
        self.runtime_dir().join("startup_notification")
    }
}
