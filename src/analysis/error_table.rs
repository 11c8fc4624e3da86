//! Table of current diagnostics per module.

use std::collections::BTreeMap;

use super::diagnostic::{Diagnostic, ModuleId};
use super::tracker::ModuleTracker;

/// Current diagnostics, keyed by module.
///
/// A module's list is always replaced as a whole; lists are never merged.
#[derive(Debug, Clone, Default)]
pub struct ErrorTable {
    entries: BTreeMap<ModuleId, Vec<Diagnostic>>,
}

impl ErrorTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a module's diagnostics.
    pub fn replace(&mut self, module: ModuleId, diagnostics: Vec<Diagnostic>) {
        self.entries.insert(module, diagnostics);
    }

    /// Drop a module's entry.
    pub fn remove(&mut self, module: &ModuleId) -> Option<Vec<Diagnostic>> {
        self.entries.remove(module)
    }

    /// Diagnostics of one module.
    #[must_use]
    pub fn get(&self, module: &ModuleId) -> Option<&[Diagnostic]> {
        self.entries.get(module).map(Vec::as_slice)
    }

    /// Modules with an entry.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleId> {
        self.entries.keys()
    }

    /// Diagnostics of the given modules; unknown modules contribute nothing.
    pub fn diagnostics_for<'a>(
        &'a self,
        modules: impl IntoIterator<Item = &'a ModuleId>,
    ) -> Vec<&'a Diagnostic> {
        modules
            .into_iter()
            .filter_map(|module| self.entries.get(module))
            .flatten()
            .collect()
    }

    /// Every diagnostic in the table.
    #[must_use]
    pub fn all(&self) -> Vec<&Diagnostic> {
        self.entries.values().flatten().collect()
    }

    /// Drop entries for modules the tracker no longer knows.
    pub fn retain_tracked(&mut self, tracker: &ModuleTracker) {
        self.entries.retain(|module, _| tracker.contains(module));
    }

    /// Number of modules with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
