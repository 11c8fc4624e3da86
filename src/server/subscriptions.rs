//! Registry of clients expecting pushed type errors.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use super::metrics;
use crate::analysis::DisplayedError;

/// Full error list as seen by subscribers.
pub type Snapshot = Arc<Vec<DisplayedError>>;

/// Receiving half handed to the connection serving a subscription.
///
/// It holds only the latest snapshot; a slow reader skips to the newest list.
pub type SubscriptionReceiver = watch::Receiver<Snapshot>;

#[derive(Debug)]
struct Subscription {
    id: Uuid,
    name: String,
    sender: watch::Sender<Snapshot>,
}

/// Open client subscriptions.
///
/// Only the dispatcher mutates the registry. Handles whose client has gone
/// away are dropped on the next [`prune`](Self::prune) or push. Each
/// subscription buffers one snapshot at most.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription and return its id and snapshot receiver.
    ///
    /// The receiver starts at `snapshot`, the error list at registration.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        snapshot: Vec<DisplayedError>,
    ) -> (Uuid, SubscriptionReceiver) {
        let (sender, receiver) = watch::channel(Arc::new(snapshot));
        let id = Uuid::new_v4();
        let name = name.into();

        tracing::info!(%id, name = %name, "Subscription registered");
        self.subscriptions.push(Subscription { id, name, sender });
        self.record();
        (id, receiver)
    }

    /// Remove a subscription; returns whether it was present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        let removed = self.subscriptions.len() < before;
        if removed {
            tracing::info!(%id, "Subscription removed");
            self.record();
        }
        removed
    }

    /// Drop subscriptions whose receiver is gone.
    pub fn prune(&mut self) {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| !s.sender.is_closed());
        if self.subscriptions.len() < before {
            tracing::debug!(
                dropped = before - self.subscriptions.len(),
                "Dropped closed subscriptions"
            );
            self.record();
        }
    }

    /// Publish the full error list to every subscription, replacing any
    /// list a subscriber has not read yet.
    ///
    /// Returns the number of clients reached; unreachable ones are removed.
    pub fn push(&mut self, errors: Vec<DisplayedError>) -> usize {
        let snapshot: Snapshot = Arc::new(errors);
        self.subscriptions.retain(|s| {
            match s.sender.send(Arc::clone(&snapshot)) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(id = %s.id, name = %s.name, "Subscriber went away");
                    false
                }
            }
        });
        self.record();

        let reached = self.subscriptions.len();
        metrics::PUSHES_TOTAL.inc_by(reached as u64);
        reached
    }

    /// Names of the open subscriptions, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.name.as_str())
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether there are no open subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    #[allow(clippy::cast_possible_wrap)]
    fn record(&self) {
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.subscriptions.len() as i64);
    }
}
