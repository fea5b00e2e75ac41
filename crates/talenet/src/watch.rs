//! Follow identities and print each update as a JSON line.

use std::sync::Arc;

use miette::Result;
use tracing::{info, warn};

use talenet_identity::{AdapterConfig, Identity, IdentityAdapter, MemoryLog};

/// Run until Ctrl-C.
pub async fn run(log: MemoryLog, config: AdapterConfig, keys: Vec<String>) -> Result<()> {
    let adapter = IdentityAdapter::new(Arc::new(log), config);
    adapter.connect().await.map_err(|e| miette::miette!("{}", e))?;

    let own_key_handle = adapter.subscribe_own_identity_key(|key| {
        println!("{}", serde_json::json!({ "ownIdentityKey": key }));
    });

    let mut watched = keys;
    watched.push(adapter.own_identity_key().to_string());
    watched.sort();
    watched.dedup();

    let subscription = adapter.subscribe_identities(print_identity, watched.clone()).await;

    match subscription.backfill.wait().await {
        Ok(report) => info!(
            keys = watched.len(),
            scanned = report.scanned,
            matched = report.matched,
            "skill history loaded"
        ),
        Err(e) => warn!(error = %e, "skill history incomplete"),
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for Ctrl-C: {}", e))?;
    info!("interrupted, shutting down");

    adapter.unsubscribe(&subscription.handle);
    adapter.unsubscribe(&own_key_handle);
    adapter.shutdown().await;
    Ok(())
}

fn print_identity(identity: &Identity) {
    match serde_json::to_string(identity) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(key = %identity.key(), error = %e, "failed to encode identity"),
    }
}
