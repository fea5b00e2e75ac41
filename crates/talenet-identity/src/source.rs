//! Interface to the append-only log the projection reads from and publishes to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{IdentityError, ImageFile, LogEvent};

/// Stream of log events.
pub type EventStream = BoxStream<'static, Result<LogEvent, IdentityError>>;

/// Push handler for newly appended events of one type.
pub type EventHandler = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// Handlers keyed by event type.
pub type HandlerMap = HashMap<String, EventHandler>;

/// The log as seen by the identity projection.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Stream every event of `event_type` from the beginning of history.
    ///
    /// Each call starts a fresh replay. With `live = false` the stream ends at
    /// the end of current history; with `live = true` it continues with
    /// events appended later.
    async fn stream_by_type(&self, event_type: &str, live: bool) -> Result<EventStream, IdentityError>;

    /// Live stream of every `about` event, history first.
    async fn stream_identity_events(&self) -> Result<EventStream, IdentityError>;

    /// Append an event authored by the local identity.
    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<(), IdentityError>;

    /// Store a file and return its content reference.
    async fn store_blob(&self, file: &ImageFile) -> Result<String, IdentityError>;

    /// Key of the local author.
    fn local_identity_key(&self) -> &str;

    /// Register push handlers for events appended from now on.
    fn register_handlers(&self, handlers: HandlerMap);
}
