//! Module tracker: resolution between source paths and module identifiers.
//!
//! Walks the project root respecting .gitignore and keeps both directions
//! of the path/module mapping current as files change.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use ignore::WalkBuilder;

use super::diagnostic::ModuleId;

/// Marker file name denoting a package's own module.
const PACKAGE_INIT: &str = "__init__";

/// Effect of a file change on the tracked module set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleUpdate {
    /// A module appeared.
    New(ModuleId),
    /// A tracked module's source changed.
    Changed(ModuleId),
    /// A tracked module's source disappeared.
    Removed(ModuleId),
}

impl ModuleUpdate {
    /// The affected module.
    #[must_use]
    pub fn module(&self) -> &ModuleId {
        match self {
            Self::New(module) | Self::Changed(module) | Self::Removed(module) => module,
        }
    }
}

/// Tracks which source file defines which module.
#[derive(Debug, Clone)]
pub struct ModuleTracker {
    root: PathBuf,
    suffixes: Vec<String>,
    modules: BTreeMap<ModuleId, PathBuf>,
    paths: HashMap<PathBuf, ModuleId>,
}

impl ModuleTracker {
    /// Create an empty tracker.
    pub fn new(root: impl Into<PathBuf>, suffixes: Vec<String>) -> Self {
        Self {
            root: root.into(),
            suffixes,
            modules: BTreeMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Create a tracker populated from every tracked file under `root`.
    pub fn scan(root: impl Into<PathBuf>, suffixes: Vec<String>) -> Self {
        let mut tracker = Self::new(root, suffixes);

        let walker = WalkBuilder::new(&tracker.root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .ignore(true)
            .build();

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_some_and(|t| t.is_file()) {
                        tracker.track(entry.path());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error walking project root");
                }
            }
        }

        tracing::info!(
            root = %tracker.root.display(),
            modules = tracker.len(),
            "Module scan complete"
        );
        tracker
    }

    /// Project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the module identifier a path would define.
    ///
    /// Returns `None` for paths outside the root or without a tracked suffix.
    #[must_use]
    pub fn qualifier(&self, path: &Path) -> Option<ModuleId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let extension = relative.extension()?.to_str()?;
        if !self.suffixes.iter().any(|s| s == extension) {
            return None;
        }

        let mut parts = Vec::new();
        for component in relative.with_extension("").components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        if parts.last().is_some_and(|last| last == PACKAGE_INIT) {
            parts.pop();
        }
        if parts.is_empty() {
            return None;
        }
        Some(ModuleId::new(parts.join(".")))
    }

    /// Record a module's source path.
    pub fn insert(&mut self, module: ModuleId, path: PathBuf) {
        if let Some(previous) = self.modules.insert(module.clone(), path.clone()) {
            self.paths.remove(&previous);
        }
        self.paths.insert(path, module);
    }

    fn track(&mut self, path: &Path) -> Option<ModuleId> {
        let module = self.qualifier(path)?;
        self.insert(module.clone(), path.to_path_buf());
        Some(module)
    }

    /// Resolve a path (absolute, or relative to the root) to its module.
    #[must_use]
    pub fn lookup_path(&self, path: &Path) -> Option<&ModuleId> {
        if path.is_absolute() {
            self.paths.get(path)
        } else {
            self.paths.get(&self.root.join(path))
        }
    }

    /// Source path of a module.
    #[must_use]
    pub fn path_of(&self, module: &ModuleId) -> Option<&Path> {
        self.modules.get(module).map(PathBuf::as_path)
    }

    /// Source path of a module, relative to the root.
    #[must_use]
    pub fn relative_path(&self, module: &ModuleId) -> Option<String> {
        let path = self.path_of(module)?;
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        Some(relative.to_string_lossy().into_owned())
    }

    /// Whether a module is tracked.
    #[must_use]
    pub fn contains(&self, module: &ModuleId) -> bool {
        self.modules.contains_key(module)
    }

    /// Tracked modules in identifier order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleId> {
        self.modules.keys()
    }

    /// Number of tracked modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Apply file changes and report the affected modules.
    ///
    /// Existing files with a tracked suffix are added or marked changed;
    /// vanished files that were tracked are removed. Everything else is
    /// ignored. Each module is reported at most once, with its latest
    /// state, except that a module created in this batch stays `New`.
    pub fn update(&mut self, paths: &[PathBuf]) -> Vec<ModuleUpdate> {
        let mut updates: Vec<ModuleUpdate> = Vec::new();

        for path in paths {
            let update = if path.is_file() {
                let Some(module) = self.qualifier(path) else {
                    continue;
                };
                let known = self.contains(&module);
                self.insert(module.clone(), path.clone());
                if known {
                    ModuleUpdate::Changed(module)
                } else {
                    ModuleUpdate::New(module)
                }
            } else {
                let Some(module) = self.paths.remove(path) else {
                    continue;
                };
                self.modules.remove(&module);
                ModuleUpdate::Removed(module)
            };

            if let Some(index) = updates.iter().position(|u| u.module() == update.module()) {
                let previous = updates.remove(index);
                if matches!(
                    (&previous, &update),
                    (ModuleUpdate::New(_), ModuleUpdate::Changed(_))
                ) {
                    updates.push(previous);
                    continue;
                }
            }
            updates.push(update);
        }

        updates
    }
}
