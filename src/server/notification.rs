//! Startup notification: a message left for the next server start.

use std::io::ErrorKind;
use std::path::Path;

use chrono::Utc;

use crate::config::CriticalFile;
use crate::Result;

/// Message explaining a stop caused by a critical file change.
#[must_use]
pub fn critical_file_message(path: &Path, pattern: &CriticalFile) -> String {
    format!(
        "Restarted because {} changed (matches critical file pattern {pattern})",
        path.display()
    )
}

/// Leave `message` for the next start, replacing any previous one.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn write(path: &Path, message: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let line = format!("{} {message}\n", Utc::now().to_rfc3339());
    tokio::fs::write(path, line).await?;
    tracing::debug!(path = %path.display(), "Startup notification written");
    Ok(())
}

/// Read and delete the pending notification, if any.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read or removed.
pub async fn consume(path: &Path) -> Result<Option<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    tokio::fs::remove_file(path).await?;
    Ok(Some(contents.trim_end().to_string()))
}
