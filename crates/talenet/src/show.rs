//! Replay the journal and print one folded identity.

use miette::Result;
use tracing::debug;

use talenet_identity::{
    AdapterConfig, Identity, IdentityStore, MemoryLog, Projection, Scope, SubscriptionRegistry,
};

/// Fold the whole journal in append order and return the identity for `key`.
pub fn fold(log: &MemoryLog, config: &AdapterConfig, key: &str) -> Identity {
    let projection = Projection::new(
        IdentityStore::new(),
        SubscriptionRegistry::new(Scope::Identities),
        config.skill_assignment_type(),
    );

    let history = log.history();
    let changed = history
        .iter()
        .filter(|event| projection.fold_logged(event).is_some())
        .count();
    debug!(events = history.len(), changed, "replayed journal");

    projection.store().get(key)
}

pub fn run(log: &MemoryLog, config: &AdapterConfig, key: &str) -> Result<()> {
    let identity = fold(log, config, key);
    let json = serde_json::to_string_pretty(&identity).map_err(|e| miette::miette!("{}", e))?;
    println!("{json}");
    Ok(())
}
