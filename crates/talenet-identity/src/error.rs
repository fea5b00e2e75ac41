//! Error types for the identity projection.

use thiserror::Error;

/// Errors that can occur while folding, publishing or subscribing.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// An event could not be folded (unknown action, missing or ambiguous payload).
    #[error("malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: String, reason: String },

    /// The log rejected or could not durably append an event.
    #[error("publish failed for {event_type}: {reason}")]
    Publish { event_type: String, reason: String },

    /// Blob storage failed before any event was published.
    #[error("blob storage failed: {0}")]
    BlobStorage(String),

    /// The event source could not be opened.
    #[error("event source unavailable: {0}")]
    SourceUnavailable(String),

    /// `connect` was called while the engine is already running.
    #[error("adapter is already connected")]
    AlreadyConnected,

    /// The engine stopped before answering a request.
    #[error("adapter is not connected")]
    Disconnected,

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Journal I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IdentityError {
    pub(crate) fn malformed(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }
}
