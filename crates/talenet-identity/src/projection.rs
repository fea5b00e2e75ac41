//! The ingestion fold: log event → identity store → subscribers.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::registry::SubscriptionRegistry;
use crate::store::IdentityStore;
use crate::{Identity, IdentityError, IdentityEvent, LogEvent};

/// Folds log events into an [`IdentityStore`] and propagates every change to
/// an identity-scoped [`SubscriptionRegistry`].
pub struct Projection {
    store: Arc<IdentityStore>,
    subscriptions: Arc<SubscriptionRegistry<Identity>>,
    skill_assignment_type: String,
}

impl Projection {
    pub fn new(
        store: Arc<IdentityStore>,
        subscriptions: Arc<SubscriptionRegistry<Identity>>,
        skill_assignment_type: impl Into<String>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            skill_assignment_type: skill_assignment_type.into(),
        }
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry<Identity>> {
        &self.subscriptions
    }

    pub fn skill_assignment_type(&self) -> &str {
        &self.skill_assignment_type
    }

    /// Fold one event.
    ///
    /// Returns the new identity if the event changed it, `None` if the event
    /// is of an unrelated type or folding it changed nothing (e.g. a
    /// re-delivered assignment). Changed identities are stored and propagated.
    pub fn fold(&self, event: &LogEvent) -> Result<Option<Identity>, IdentityError> {
        let Some(decoded) = IdentityEvent::decode(event, &self.skill_assignment_type)? else {
            trace!(id = %event.id, event_type = ?event.event_type(), "ignoring unrelated event");
            return Ok(None);
        };

        let current = self.store.get(decoded.author());
        let updated = match &decoded {
            IdentityEvent::About { update, .. } => current.with_about(update),
            IdentityEvent::SkillAssignment(assignment) => current.with_skill_assignment(assignment)?,
        };

        if updated == current && self.store.contains(updated.key()) {
            trace!(id = %event.id, key = %updated.key(), "event already folded");
            return Ok(None);
        }

        self.store.put(updated.clone());
        let delivered = self.subscriptions.propagate(updated.key(), &updated);
        debug!(id = %event.id, key = %updated.key(), delivered, "identity updated");
        Ok(Some(updated))
    }

    /// Fold one event, logging and swallowing malformed events so a stream of
    /// events keeps flowing past a bad one.
    pub fn fold_logged(&self, event: &LogEvent) -> Option<Identity> {
        match self.fold(event) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(id = %event.id, author = %event.author, error = %e, "rejected event");
                None
            }
        }
    }
}
