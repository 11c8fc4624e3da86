//! Critical-file patterns.
//!
//! A change to a critical file (build configuration, dependency manifests)
//! invalidates the whole analysis, so the server stops instead of rechecking.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::Error;

/// A pattern identifying files whose change forces a server restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CriticalFile {
    /// Exact file name, in any directory.
    BaseName(String),
    /// File extension, without the leading dot.
    Extension(String),
    /// One specific absolute path.
    FullPath(PathBuf),
}

impl CriticalFile {
    /// Check whether `path` matches this pattern.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Self::BaseName(name) => path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == name),
            Self::Extension(ext) => path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == ext),
            Self::FullPath(full) => path == full,
        }
    }

    /// Find the first changed path matching any pattern.
    #[must_use]
    pub fn find_match<'a>(
        patterns: &'a [Self],
        paths: &'a [PathBuf],
    ) -> Option<(&'a Path, &'a Self)> {
        paths.iter().find_map(|path| {
            patterns
                .iter()
                .find(|pattern| pattern.matches(path))
                .map(|pattern| (path.as_path(), pattern))
        })
    }
}

impl fmt::Display for CriticalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaseName(name) => write!(f, "basename:{name}"),
            Self::Extension(ext) => write!(f, "ext:{ext}"),
            Self::FullPath(path) => write!(f, "path:{}", path.display()),
        }
    }
}

impl FromStr for CriticalFile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s.split_once(':').ok_or_else(|| {
            Error::config(format!(
                "invalid critical file '{s}', expected basename:NAME, ext:EXT or path:PATH"
            ))
        })?;

        if value.is_empty() {
            return Err(Error::config(format!("critical file '{s}' has no value")));
        }

        match kind {
            "basename" => Ok(Self::BaseName(value.to_string())),
            "ext" | "extension" => Ok(Self::Extension(value.trim_start_matches('.').to_string())),
            "path" => {
                let path = PathBuf::from(value);
                if path.is_absolute() {
                    Ok(Self::FullPath(path))
                } else {
                    Err(Error::config(format!(
                        "critical file path '{value}' must be absolute"
                    )))
                }
            }
            other => Err(Error::config(format!(
                "unknown critical file kind '{other}'"
            ))),
        }
    }
}
