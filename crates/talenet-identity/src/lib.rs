//! Identity projection and subscription engine for Talenet.
//!
//! Rebuilds each author's current identity (display name, avatar image,
//! assigned skills) from an append-only, multi-author event log and keeps
//! observers notified as new events are folded in.
//!
//! ## Features
//!
//! - **Identity**: Immutable per-author value with functional `with_*` folds
//! - **Store**: Author key to current identity, defaults for unknown keys
//! - **Registry**: Cancellable, re-entrant-safe observer callbacks per scope
//! - **Adapter**: Single engine task folding the log, plus the publish API
//! - **MemoryLog**: In-process log with optional JSON-lines journal

mod adapter;
mod config;
mod error;
mod identity;
pub mod memory;
mod projection;
pub mod registry;
pub mod source;
pub mod store;
mod types;

pub use adapter::{Backfill, BackfillReport, IdentityAdapter, IdentitySubscription};
pub use config::AdapterConfig;
pub use error::IdentityError;
pub use identity::Identity;
pub use memory::{MemoryLog, blob_link};
pub use projection::Projection;
pub use registry::{Callback, Scope, SubscriptionHandle, SubscriptionId, SubscriptionRegistry};
pub use source::{EventHandler, EventSource, EventStream, HandlerMap};
pub use store::IdentityStore;
pub use types::*;
