//! Recheck scheduling.
//!
//! The analysis itself lives outside this crate. [`Checker`] is the seam the
//! dispatcher awaits; [`CommandChecker`] fans a recheck out over several
//! concurrent external checker processes and waits for all of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::diagnostic::{Diagnostic, Location, ModuleId};
use super::tracker::ModuleTracker;
use crate::error::ServerError;
use crate::{Config, Error, Result};

/// Fresh diagnostics for a set of rechecked modules.
pub type CheckResults = Vec<(ModuleId, Vec<Diagnostic>)>;

/// Runs the analysis over a set of modules.
///
/// Every requested module must appear in the result, with an empty list when
/// it has no diagnostics, so its table entry is replaced.
#[allow(async_fn_in_trait)]
pub trait Checker {
    /// Recheck `modules` and return their complete diagnostics.
    async fn check(&mut self, tracker: &ModuleTracker, modules: &[ModuleId])
        -> Result<CheckResults>;
}

/// One error as printed by the external checker.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportedError {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
    pub code: u32,
    pub description: String,
}

/// Checker backed by an external program.
///
/// The program receives absolute file paths as trailing arguments and prints
/// a JSON array of [`ReportedError`] on stdout.
#[derive(Debug, Clone)]
pub struct CommandChecker {
    program: PathBuf,
    args: Vec<String>,
    jobs: usize,
}

impl CommandChecker {
    /// Create a checker running at most `jobs` processes at once.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, jobs: usize) -> Self {
        Self {
            program: program.into(),
            args,
            jobs: jobs.max(1),
        }
    }

    /// Build the checker from server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no checker command is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let program = config
            .checker_command
            .clone()
            .ok_or_else(|| Error::config("a checker command is required to serve"))?;
        Ok(Self::new(program, config.checker_args.clone(), config.jobs))
    }

    async fn run(&self, files: Vec<&Path>) -> Result<Vec<ReportedError>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(&files)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ServerError::Check(format!(
                    "failed to run '{}': {e}",
                    self.program.display()
                ))
            })?;

        // Checkers commonly exit non-zero when they report errors, so only
        // unparseable output is a failure.
        serde_json::from_slice(&output.stdout).map_err(|e| {
            ServerError::Check(format!(
                "'{}' exited with {} and printed invalid output: {e}",
                self.program.display(),
                output.status
            ))
            .into()
        })
    }
}

impl Checker for CommandChecker {
    async fn check(
        &mut self,
        tracker: &ModuleTracker,
        modules: &[ModuleId],
    ) -> Result<CheckResults> {
        let mut results: BTreeMap<ModuleId, Vec<Diagnostic>> = modules
            .iter()
            .map(|module| (module.clone(), Vec::new()))
            .collect();

        let files: Vec<&Path> = modules
            .iter()
            .filter_map(|module| tracker.path_of(module))
            .collect();
        if files.is_empty() {
            return Ok(results.into_iter().collect());
        }

        let chunk_size = files.len().div_ceil(self.jobs);
        let runs = files.chunks(chunk_size).map(|chunk| self.run(chunk.to_vec()));

        tracing::debug!(
            files = files.len(),
            processes = files.len().div_ceil(chunk_size),
            "Running checker"
        );
        let reports = futures::future::try_join_all(runs).await?;

        for reported in reports.into_iter().flatten() {
            let Some(module) = tracker.lookup_path(&reported.path) else {
                tracing::debug!(path = %reported.path.display(), "Checker reported an untracked file");
                continue;
            };
            if let Some(diagnostics) = results.get_mut(module) {
                diagnostics.push(Diagnostic {
                    module: module.clone(),
                    location: Location {
                        line: reported.line,
                        column: reported.column,
                    },
                    code: reported.code,
                    description: reported.description,
                });
            }
        }

        Ok(results.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let script = dir.join(name);
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn tracked(tmp: &TempDir) -> ModuleTracker {
        let mut tracker = ModuleTracker::new(tmp.path(), vec!["py".to_string()]);
        tracker.insert(ModuleId::from("a"), tmp.path().join("a.py"));
        tracker.insert(ModuleId::from("b"), tmp.path().join("b.py"));
        tracker
    }

    #[tokio::test]
    async fn test_every_module_gets_an_entry() {
        let tmp = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let report = format!(
            r#"[{{"path": "{}", "line": 3, "column": 4, "code": 7, "description": "Incompatible return type"}}]"#,
            tmp.path().join("a.py").display()
        );
        let script = write_script(tools.path(), "checker", &format!("echo '{report}'\nexit 1"));

        let tracker = tracked(&tmp);
        let mut checker = CommandChecker::new(script, Vec::new(), 1);
        let results = checker
            .check(&tracker, &[ModuleId::from("a"), ModuleId::from("b")])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, ModuleId::from("a"));
        assert_eq!(results[0].1.len(), 1);
        assert_eq!(results[0].1[0].location, Location { line: 3, column: 4 });
        assert_eq!(results[1], (ModuleId::from("b"), Vec::new()));
    }

    #[tokio::test]
    async fn test_invalid_output_fails() {
        let tmp = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let script = write_script(tools.path(), "checker", "echo 'Segmentation fault'\nexit 139");

        let tracker = tracked(&tmp);
        let mut checker = CommandChecker::new(script, Vec::new(), 2);
        let err = checker
            .check(&tracker, &[ModuleId::from("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(ServerError::Check(_))));
    }

    #[tokio::test]
    async fn test_untracked_modules_skip_the_process() {
        let tmp = TempDir::new().unwrap();
        let tracker = tracked(&tmp);
        let mut checker = CommandChecker::new("/nonexistent/checker", Vec::new(), 4);

        let results = checker
            .check(&tracker, &[ModuleId::from("gone")])
            .await
            .unwrap();
        assert_eq!(results, vec![(ModuleId::from("gone"), Vec::new())]);
    }

    #[test]
    fn test_from_config_requires_command() {
        let config = Config {
            root: PathBuf::from("/repo"),
            ..Default::default()
        };
        assert!(CommandChecker::from_config(&config).is_err());

        let config = Config {
            checker_command: Some(PathBuf::from("/usr/bin/checker")),
            jobs: 3,
            ..config
        };
        let checker = CommandChecker::from_config(&config).unwrap();
        assert_eq!(checker.jobs, 3);
    }
}
