//! Subscription registry: cancellable observer callbacks grouped by scope.
//!
//! Callbacks run synchronously inside [`SubscriptionRegistry::propagate`],
//! with no registry lock held, so a callback may subscribe or unsubscribe
//! (including itself) while being invoked.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, trace};

/// Callback invoked with each propagated value.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// What a registry's subscribers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The local process's own identity key.
    OwnIdentityKey,
    /// Identities matched by an explicit key set.
    Identities,
}

/// Identifier of a subscription within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Listener<T> {
    /// `None` matches every key in the scope.
    filter: Option<HashSet<String>>,
    callback: Callback<T>,
    cancelled: Arc<AtomicBool>,
}

impl<T> Listener<T> {
    fn matches(&self, key: &str) -> bool {
        self.filter.as_ref().is_none_or(|keys| keys.contains(key))
    }
}

type Listeners<T> = DashMap<SubscriptionId, Listener<T>>;

/// Handle returned by `subscribe`, used to cancel the subscription.
///
/// Dropping the handle does not cancel; cancellation is explicit.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    scope: Scope,
    cancelled: Arc<AtomicBool>,
    detach: Arc<dyn Fn(SubscriptionId) + Send + Sync>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the subscription. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            trace!(id = ?self.id, "subscription already cancelled");
            return;
        }
        (self.detach)(self.id);
        debug!(id = ?self.id, scope = ?self.scope, "subscription cancelled");
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registry of observers for one scope.
pub struct SubscriptionRegistry<T> {
    scope: Scope,
    listeners: Arc<Listeners<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> SubscriptionRegistry<T> {
    /// Create a new empty registry.
    pub fn new(scope: Scope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Register a callback.
    ///
    /// With `keys = None` the callback observes every key in the scope;
    /// otherwise only keys in the set.
    pub fn subscribe(&self, keys: Option<HashSet<String>>, callback: Callback<T>) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(AtomicBool::new(false));

        self.listeners.insert(
            id,
            Listener {
                filter: keys,
                callback,
                cancelled: Arc::clone(&cancelled),
            },
        );

        let listeners: Weak<Listeners<T>> = Arc::downgrade(&self.listeners);
        let detach = Arc::new(move |id: SubscriptionId| {
            if let Some(listeners) = listeners.upgrade() {
                listeners.remove(&id);
            }
        });

        debug!(id = ?id, scope = ?self.scope, "subscription registered");
        SubscriptionHandle {
            id,
            scope: self.scope,
            cancelled,
            detach,
        }
    }

    /// Cancel a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Invoke every live callback whose filter matches `key`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn propagate(&self, key: &str, value: &T) -> usize {
        // Collect first so no shard lock is held while callbacks run.
        let targets: Vec<(Callback<T>, Arc<AtomicBool>)> = self
            .listeners
            .iter()
            .filter(|r| r.value().matches(key))
            .map(|r| (Arc::clone(&r.value().callback), Arc::clone(&r.value().cancelled)))
            .collect();

        let mut delivered = 0;
        for (callback, cancelled) in targets {
            // An earlier callback in this round may have cancelled this one.
            if cancelled.load(Ordering::SeqCst) {
                continue;
            }
            callback(value);
            delivered += 1;
        }

        trace!(key = %key, scope = ?self.scope, delivered, "propagated update");
        delivered
    }

    /// Invoke one subscription's callback, used to replay current state to a
    /// new subscriber. Returns false if it was cancelled or filters `key` out.
    pub fn deliver(&self, handle: &SubscriptionHandle, key: &str, value: &T) -> bool {
        let callback = match self.listeners.get(&handle.id) {
            Some(listener) if listener.matches(key) => Arc::clone(&listener.callback),
            _ => return false,
        };
        if handle.is_cancelled() {
            return false;
        }
        callback(value);
        true
    }

    /// Get the number of live subscriptions.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
