//! Error types and Result aliases for recheckd.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.

use thiserror::Error;

/// Result type alias using recheckd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for recheckd operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Watcher discovery or socket failure before a subscription exists.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol failure after a watcher connection exists.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Server/dispatcher error.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures while locating or opening the watcher socket.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The watcher executable could not be found.
    #[error("executable not found: '{program}' (search path: {search_path})")]
    ExecutableNotFound { program: String, search_path: String },

    /// The discovery subprocess could not be started.
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// Discovery exited successfully but printed something that is not JSON.
    #[error("invalid discovery output: {0}")]
    InvalidOutput(String),

    /// Discovery output is JSON but has no string `sockname` field.
    #[error("discovery output has no `sockname` field")]
    MissingSockname,

    /// Discovery exited with a non-zero code.
    #[error("discovery exited with code {0}")]
    ExitCode(i32),

    /// Discovery was killed by a signal.
    #[error("discovery was killed by signal {0}")]
    Signaled(i32),

    /// Discovery was stopped by a signal.
    #[error("discovery was stopped by signal {0}")]
    Stopped(i32),

    /// Connecting to the local socket failed.
    #[error("failed to connect to '{path}': {reason}")]
    Socket { path: String, reason: String },
}

/// Protocol failures on an open watcher connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Malformed payload or unexpected message shape.
    #[error("{0}")]
    Protocol(String),

    /// The stream ended before the subscription was acknowledged.
    #[error("no initial response")]
    NoInitialResponse,

    /// The watcher answered with an `error` field.
    #[error("watcher rejected subscription: {0}")]
    Rejected(String),

    /// The acknowledgment carried no usable clock.
    #[error("cannot determine initial clock")]
    MissingClock,

    /// The watcher reset its view of the filesystem.
    #[error("received is_fresh_instance")]
    FreshInstance,

    /// Writing to the watcher socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The change-batch consumer failed.
    #[error("consumer error: {0}")]
    Consumer(String),
}

/// Server/dispatcher errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind the client socket.
    #[error("failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Request handling error.
    #[error("request error: {0}")]
    Request(String),

    /// The external checker failed.
    #[error("check failed: {0}")]
    Check(String),

    /// No server answered on the socket.
    #[error("no server is running at {0}")]
    NotRunning(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl SubscriptionError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests;
