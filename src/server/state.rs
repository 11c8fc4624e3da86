//! Server state owned by the dispatcher.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::metrics;
use super::subscriptions::SubscriptionRegistry;
use crate::analysis::{ErrorTable, ModuleId, ModuleTracker};
use crate::Config;

/// Everything the dispatcher reads and mutates.
///
/// Exactly one task owns this value; requests see each other's effects in
/// the order they were processed. The error table and the pending set only
/// hold modules the tracker knows.
#[derive(Debug)]
pub struct ServerState {
    pub config: Config,
    pub socket_path: PathBuf,
    pub tracker: ModuleTracker,
    pub errors: ErrorTable,
    /// Modules whose last recheck failed; retried with the next update.
    pub pending: BTreeSet<ModuleId>,
    pub subscriptions: SubscriptionRegistry,
}

impl ServerState {
    /// State tracking every source file currently under the root.
    #[must_use]
    pub fn scan(config: Config) -> Self {
        let tracker = ModuleTracker::scan(&config.root, config.suffixes.clone());
        Self::with_tracker(config, tracker)
    }

    fn with_tracker(config: Config, tracker: ModuleTracker) -> Self {
        let state = Self {
            socket_path: config.socket_path(),
            config,
            tracker,
            errors: ErrorTable::new(),
            pending: BTreeSet::new(),
            subscriptions: SubscriptionRegistry::new(),
        };
        state.record_modules();
        state
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn record_modules(&self) {
        metrics::TRACKED_MODULES.set(self.tracker.len() as i64);
    }
}
