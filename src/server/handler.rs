//! Request dispatch against the server state.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::metrics;
use super::notification;
use super::protocol::{Request, Response, ServerInfo, StopReason};
use super::state::ServerState;
use crate::analysis::{instantiate_sorted, Checker, DisplayedError, ModuleId, ModuleUpdate};
use crate::config::CriticalFile;
use crate::Result;

/// Process one request to completion.
///
/// `Stop` and critical file changes answer with [`Response::Stop`]; the
/// caller is expected to shut the server down afterwards.
///
/// # Errors
///
/// Returns an error if the checker fails or server details cannot be
/// serialized. Paths that resolve to no module are never an error.
pub async fn process_request<C: Checker>(
    state: &mut ServerState,
    checker: &mut C,
    request: Request,
) -> Result<Response> {
    tracing::debug!(kind = request.kind(), "Processing request");

    match request {
        Request::GetInfo => Ok(Response::Info(ServerInfo::new(state)?)),
        Request::DisplayTypeError { paths } => Ok(Response::TypeErrors {
            errors: display_type_errors(state, &paths),
        }),
        Request::IncrementalUpdate { paths } => incremental_update(state, checker, paths).await,
        Request::Stop => Ok(Response::Stop {
            reason: StopReason::Requested,
        }),
    }
}

/// Sorted errors of the modules owning `paths`, or of every module.
#[must_use]
pub fn display_type_errors(state: &ServerState, paths: &[PathBuf]) -> Vec<DisplayedError> {
    let diagnostics = if paths.is_empty() {
        state.errors.all()
    } else {
        let modules: BTreeSet<&ModuleId> = paths
            .iter()
            .filter_map(|path| state.tracker.lookup_path(path))
            .collect();
        state.errors.diagnostics_for(modules)
    };
    instantiate_sorted(diagnostics, &state.tracker)
}

async fn incremental_update<C: Checker>(
    state: &mut ServerState,
    checker: &mut C,
    paths: Vec<PathBuf>,
) -> Result<Response> {
    if let Some((path, pattern)) = CriticalFile::find_match(&state.config.critical_files, &paths) {
        return Ok(stop_for_critical_file(state, path.to_path_buf(), pattern).await);
    }

    metrics::FILES_CHANGED_TOTAL.inc_by(paths.len() as u64);

    let retried = state.pending.len();
    let mut recheck = std::mem::take(&mut state.pending);
    for update in state.tracker.update(&paths) {
        if let ModuleUpdate::New(module) | ModuleUpdate::Changed(module) = update {
            recheck.insert(module);
        }
    }
    state.errors.retain_tracked(&state.tracker);
    recheck.retain(|module| state.tracker.contains(module));
    state.record_modules();

    if !recheck.is_empty() {
        let modules: Vec<ModuleId> = recheck.into_iter().collect();
        tracing::info!(
            changed = paths.len(),
            modules = modules.len(),
            retried,
            "Rechecking modules"
        );
        if let Err(e) = recheck_modules(state, checker, &modules).await {
            tracing::warn!(
                modules = modules.len(),
                "Recheck failed, retrying with the next update"
            );
            state.pending.extend(modules);
            return Err(e);
        }
    }

    state.subscriptions.prune();
    if !state.subscriptions.is_empty() {
        let errors = instantiate_sorted(state.errors.all(), &state.tracker);
        let count = errors.len();
        let reached = state.subscriptions.push(errors);
        tracing::debug!(errors = count, subscribers = reached, "Pushed type errors");
    }

    Ok(Response::Ok)
}

/// Check every tracked module and fill the error table.
///
/// # Errors
///
/// Returns an error if the checker fails.
pub async fn check_all<C: Checker>(state: &mut ServerState, checker: &mut C) -> Result<()> {
    let modules: Vec<ModuleId> = state.tracker.modules().cloned().collect();
    if modules.is_empty() {
        return Ok(());
    }

    tracing::info!(modules = modules.len(), "Running initial check");
    recheck_modules(state, checker, &modules).await?;
    tracing::info!(
        modules = state.errors.len(),
        errors = state.errors.all().len(),
        "Initial check complete"
    );
    Ok(())
}

async fn recheck_modules<C: Checker>(
    state: &mut ServerState,
    checker: &mut C,
    modules: &[ModuleId],
) -> Result<()> {
    let results = checker.check(&state.tracker, modules).await?;
    for (module, diagnostics) in results {
        if state.tracker.contains(&module) {
            state.errors.replace(module, diagnostics);
        }
    }
    metrics::RECHECKS_TOTAL.inc();
    Ok(())
}

async fn stop_for_critical_file(
    state: &ServerState,
    path: PathBuf,
    pattern: &CriticalFile,
) -> Response {
    tracing::warn!(
        path = %path.display(),
        pattern = %pattern,
        "Critical file changed, stopping for restart"
    );
    metrics::CRITICAL_RESTARTS_TOTAL.inc();

    let message = notification::critical_file_message(&path, pattern);
    let notification_path = state.config.notification_path();
    if let Err(e) = notification::write(&notification_path, &message).await {
        tracing::warn!(
            error = %e,
            path = %notification_path.display(),
            "Failed to write startup notification"
        );
    }

    Response::Stop {
        reason: StopReason::CriticalFileChanged {
            path,
            pattern: pattern.to_string(),
        },
    }
}
