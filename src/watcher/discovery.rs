//! Watcher socket discovery and the connection factory.
//!
//! The watcher publishes its socket through its own command line
//! (`watchman get-sockname`). Discovery runs that subcommand, classifies how
//! it exited and extracts the `sockname` field from its output.

use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;

use super::connection::{Connection, MockConnection, SocketConnection};
use crate::error::ConnectionError;
use crate::Result;

/// Exit code a shell reports for a missing executable.
const EXIT_NOT_FOUND: i32 = 127;

/// How the discovery process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Exited normally with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Stopped by a signal.
    Stopped(i32),
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::Exited(code)
        } else if let Some(signal) = status.signal() {
            Self::Signaled(signal)
        } else if let Some(signal) = status.stopped_signal() {
            Self::Stopped(signal)
        } else {
            Self::Exited(-1)
        }
    }
}

/// Classify a finished discovery run and extract the socket path.
///
/// # Errors
///
/// Returns a [`ConnectionError`] describing the exit status, or the parser
/// diagnostic when a successful run printed something unusable.
pub fn parse_discovery(
    program: &Path,
    status: ProcessStatus,
    stdout: &[u8],
) -> std::result::Result<PathBuf, ConnectionError> {
    match status {
        ProcessStatus::Exited(0) => {
            let value: serde_json::Value = serde_json::from_slice(stdout)
                .map_err(|e| ConnectionError::InvalidOutput(e.to_string()))?;
            value
                .get("sockname")
                .and_then(serde_json::Value::as_str)
                .map(PathBuf::from)
                .ok_or(ConnectionError::MissingSockname)
        }
        ProcessStatus::Exited(EXIT_NOT_FOUND) => Err(not_found(program)),
        ProcessStatus::Exited(code) => Err(ConnectionError::ExitCode(code)),
        ProcessStatus::Signaled(signal) => Err(ConnectionError::Signaled(signal)),
        ProcessStatus::Stopped(signal) => Err(ConnectionError::Stopped(signal)),
    }
}

fn not_found(program: &Path) -> ConnectionError {
    ConnectionError::ExecutableNotFound {
        program: program.display().to_string(),
        search_path: std::env::var("PATH").unwrap_or_default(),
    }
}

/// Ask the watcher for its socket path.
///
/// # Errors
///
/// Returns an error if the executable is missing, fails, or prints
/// something other than a JSON object with a `sockname` string.
pub async fn get_sockname(program: &Path) -> Result<PathBuf> {
    let output = Command::new(program)
        .args(["--no-pretty", "get-sockname"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found(program)
            } else {
                ConnectionError::Spawn {
                    program: program.display().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

    let sockname = parse_discovery(program, output.status.into(), &output.stdout)?;
    tracing::debug!(sockname = %sockname.display(), "Discovered watcher socket");
    Ok(sockname)
}

type OpenFn = dyn Fn() -> BoxFuture<'static, Result<Box<dyn Connection>>> + Send + Sync;

/// Factory producing a fresh watcher connection per call.
///
/// Holds no connection itself; every subscription attempt opens its own.
#[derive(Clone)]
pub struct Opener {
    open: Arc<OpenFn>,
}

impl Opener {
    /// Wrap an arbitrary open function.
    pub fn new<F, Fut>(open: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Connection>>> + Send + 'static,
    {
        Self {
            open: Arc::new(move || open().boxed()),
        }
    }

    /// Opener that runs discovery and connects to the watcher socket.
    #[must_use]
    pub fn watchman(program: PathBuf) -> Self {
        let program = Arc::new(program);
        Self::new(move || {
            let program = Arc::clone(&program);
            async move {
                let sockname = get_sockname(&program).await?;
                let connection = SocketConnection::connect(&sockname).await?;
                Ok::<_, crate::Error>(Box::new(connection) as Box<dyn Connection>)
            }
        })
    }

    /// Opener handing out mock connections that share one shutdown counter.
    pub fn mock(
        shutdowns: &Arc<AtomicUsize>,
        make: impl Fn() -> MockConnection + Send + Sync + 'static,
    ) -> Self {
        let shutdowns = Arc::clone(shutdowns);
        Self::new(move || {
            let connection = make().with_shutdown_counter(Arc::clone(&shutdowns));
            async move { Ok::<_, crate::Error>(Box::new(connection) as Box<dyn Connection>) }
        })
    }

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery or connecting fails.
    pub async fn open(&self) -> Result<Box<dyn Connection>> {
        (self.open)().await
    }
}

impl std::fmt::Debug for Opener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opener").finish_non_exhaustive()
    }
}

/// Check that the watcher is reachable and build an opener for it.
///
/// # Errors
///
/// Returns the discovery failure, so callers can report it without
/// dealing with a half-initialized opener.
pub async fn create(program: &Path) -> Result<Opener> {
    let sockname = get_sockname(program).await?;
    tracing::info!(
        program = %program.display(),
        sockname = %sockname.display(),
        "Watcher available"
    );
    Ok(Opener::watchman(program.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::os::unix::fs::PermissionsExt;

    fn watchman() -> &'static Path {
        Path::new("watchman")
    }

    #[test]
    fn test_parse_sockname() {
        let sockname = parse_discovery(
            watchman(),
            ProcessStatus::Exited(0),
            br#"{"version":"2024.01.22.00","sockname":"/tmp/watchman.sock"}"#,
        )
        .unwrap();
        assert_eq!(sockname, PathBuf::from("/tmp/watchman.sock"));
    }

    #[test]
    fn test_parse_invalid_json_includes_diagnostic() {
        let err = parse_discovery(watchman(), ProcessStatus::Exited(0), b"sockname?").unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidOutput(_)));
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_missing_sockname() {
        let err = parse_discovery(watchman(), ProcessStatus::Exited(0), br#"{"version":"1"}"#)
            .unwrap_err();
        assert!(matches!(err, ConnectionError::MissingSockname));
    }

    #[test]
    fn test_exit_status_classification() {
        assert!(matches!(
            parse_discovery(watchman(), ProcessStatus::Exited(127), b""),
            Err(ConnectionError::ExecutableNotFound { .. })
        ));
        assert!(matches!(
            parse_discovery(watchman(), ProcessStatus::Exited(1), b""),
            Err(ConnectionError::ExitCode(1))
        ));
        assert!(matches!(
            parse_discovery(watchman(), ProcessStatus::Signaled(9), b""),
            Err(ConnectionError::Signaled(9))
        ));
        assert!(matches!(
            parse_discovery(watchman(), ProcessStatus::Stopped(19), b""),
            Err(ConnectionError::Stopped(19))
        ));
    }

    #[tokio::test]
    async fn test_get_sockname_missing_executable() {
        let err = get_sockname(Path::new("/nonexistent/bin/watchman"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ExecutableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_sockname_runs_script() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("fake-watchman");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"sockname\": \"/tmp/fake.sock\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sockname = get_sockname(&script).await.unwrap();
        assert_eq!(sockname, PathBuf::from("/tmp/fake.sock"));
        assert!(create(&script).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_sockname_failing_script() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("broken-watchman");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = create(&script).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::ExitCode(3))));
    }

    #[tokio::test]
    async fn test_opener_yields_independent_connections() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = Opener::mock(&counter, || MockConnection::scripted(Vec::new()));

        let mut first = opener.open().await.unwrap();
        let mut second = opener.open().await.unwrap();
        first.shutdown().await;
        second.shutdown().await;

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
