//! Diagnostics and their display form.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::tracker::ModuleTracker;

/// Dotted module identifier, e.g. `pkg.sub.module`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    /// Create a module identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The dotted name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Position in a source file, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// One analysis finding, keyed by the module that produced it.
///
/// Field order defines the total order: module, location, code, then text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub module: ModuleId,
    pub location: Location,
    pub code: u32,
    pub description: String,
}

impl Diagnostic {
    /// Resolve the module reference into a display path.
    ///
    /// Modules the tracker no longer knows are shown by name.
    #[must_use]
    pub fn instantiate(&self, tracker: &ModuleTracker) -> DisplayedError {
        let path = tracker
            .relative_path(&self.module)
            .unwrap_or_else(|| self.module.to_string());

        DisplayedError {
            path,
            line: self.location.line,
            column: self.location.column,
            code: self.code,
            description: self.description.clone(),
        }
    }
}

/// A diagnostic as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayedError {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub code: u32,
    pub description: String,
}

impl fmt::Display for DisplayedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} [{}] {}",
            self.path, self.line, self.column, self.code, self.description
        )
    }
}

/// Sort diagnostics by their total order and instantiate them.
#[must_use]
pub fn instantiate_sorted(
    mut diagnostics: Vec<&Diagnostic>,
    tracker: &ModuleTracker,
) -> Vec<DisplayedError> {
    diagnostics.sort();
    diagnostics
        .into_iter()
        .map(|diagnostic| diagnostic.instantiate(tracker))
        .collect()
}
