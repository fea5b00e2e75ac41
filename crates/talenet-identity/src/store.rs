//! In-memory identity store.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::Identity;

/// Maps author keys to their current [`Identity`].
///
/// Entries are created on the first `put` for a key and never removed.
/// Callers read with `get`, fold, and write the new value back with `put`.
#[derive(Debug, Default)]
pub struct IdentityStore {
    identities: DashMap<String, Identity>,
}

impl IdentityStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current identity for `key`, or a fresh default if none was stored yet.
    pub fn get(&self, key: &str) -> Identity {
        self.identities
            .get(key)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Identity::new(key))
    }

    /// Replace the entry for `identity.key()`.
    pub fn put(&self, identity: Identity) {
        trace!(key = %identity.key(), "store: identity put");
        self.identities.insert(identity.key().to_string(), identity);
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.identities.contains_key(key)
    }

    /// Get the number of stored identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// List stored keys (sorted).
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.identities.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }
}
