//! In-process append-only log implementing [`EventSource`].
//!
//! Keeps an ordered multi-author history with per-author sequence numbers,
//! fans new events out to live streams and registered handlers, and stores
//! blobs by content hash. Optionally persists events to a JSON-lines journal
//! (one [`LogEvent`] per line) and blobs to a sibling directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace};

use crate::source::{EventHandler, EventSource, EventStream, HandlerMap};
use crate::{ABOUT_TYPE, IdentityError, ImageFile, LogEvent};

/// Content reference for a blob: `&<base64 sha256>.sha256`.
pub fn blob_link(bytes: &[u8]) -> String {
    format!("&{}.sha256", STANDARD.encode(Sha256::digest(bytes)))
}

fn event_id(author: &str, sequence: u64, content: &serde_json::Value) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", author, sequence, content).as_bytes());
    format!("%{}.sha256", STANDARD.encode(digest))
}

struct Tap {
    event_type: String,
    tx: mpsc::UnboundedSender<Result<LogEvent, IdentityError>>,
}

#[derive(Default)]
struct LogState {
    events: Vec<LogEvent>,
    /// Last sequence number per author.
    sequences: HashMap<String, u64>,
    blobs: HashMap<String, Vec<u8>>,
    taps: Vec<Tap>,
    handlers: HashMap<String, Vec<EventHandler>>,
}

struct Journal {
    path: PathBuf,
    blob_dir: PathBuf,
}

impl Journal {
    async fn append(&self, event: &LogEvent) -> Result<(), IdentityError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_blob(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        tokio::fs::create_dir_all(&self.blob_dir).await?;
        let name = URL_SAFE_NO_PAD.encode(Sha256::digest(bytes));
        tokio::fs::write(self.blob_dir.join(name), bytes).await?;
        Ok(())
    }
}

/// In-memory append-only log.
pub struct MemoryLog {
    local_key: String,
    state: Mutex<LogState>,
    /// Serializes appends so sequence numbers match journal order.
    append_lock: tokio::sync::Mutex<()>,
    journal: Option<Journal>,
}

impl MemoryLog {
    /// Create an empty, non-persistent log for the given local author.
    pub fn new(local_key: impl Into<String>) -> Self {
        Self {
            local_key: local_key.into(),
            state: Mutex::new(LogState::default()),
            append_lock: tokio::sync::Mutex::new(()),
            journal: None,
        }
    }

    /// Open a journal-backed log, replaying any events already in the file.
    ///
    /// Blobs are written to `<journal>.blobs/`.
    pub async fn open(local_key: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        let mut state = LogState::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let event: LogEvent = serde_json::from_str(line)?;
                    let last = state.sequences.entry(event.author.clone()).or_insert(0);
                    *last = (*last).max(event.sequence);
                    state.events.push(event);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "journal does not exist yet");
            }
            Err(e) => return Err(e.into()),
        }

        let mut blob_dir = path.clone().into_os_string();
        blob_dir.push(".blobs");
        let blob_dir = PathBuf::from(blob_dir);

        match tokio::fs::read_dir(&blob_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let bytes = tokio::fs::read(entry.path()).await?;
                    state.blobs.insert(blob_link(&bytes), bytes);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            path = %path.display(),
            events = state.events.len(),
            blobs = state.blobs.len(),
            "opened journal"
        );

        Ok(Self {
            local_key: local_key.into(),
            state: Mutex::new(state),
            append_lock: tokio::sync::Mutex::new(()),
            journal: Some(Journal { path, blob_dir }),
        })
    }

    /// Append an event by any author, as replication would.
    pub async fn append(
        &self,
        author: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<LogEvent, IdentityError> {
        let serde_json::Value::Object(mut content) = payload else {
            return Err(IdentityError::Publish {
                event_type: event_type.to_string(),
                reason: "payload must be a JSON object".to_string(),
            });
        };
        content.insert(
            "type".to_string(),
            serde_json::Value::String(event_type.to_string()),
        );
        let content = serde_json::Value::Object(content);

        let _guard = self.append_lock.lock().await;

        let sequence = self.state.lock().sequences.get(author).copied().unwrap_or(0) + 1;
        let event = LogEvent {
            id: event_id(author, sequence, &content),
            author: author.to_string(),
            sequence,
            timestamp: Utc::now(),
            content,
        };

        if let Some(journal) = &self.journal {
            journal.append(&event).await.map_err(|e| IdentityError::Publish {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })?;
        }

        self.commit(event.clone());
        Ok(event)
    }

    fn commit(&self, event: LogEvent) {
        let event_type = event.event_type().unwrap_or_default().to_string();

        let handlers = {
            let mut state = self.state.lock();
            state.sequences.insert(event.author.clone(), event.sequence);
            state.events.push(event.clone());
            state
                .taps
                .retain(|tap| tap.event_type != event_type || tap.tx.send(Ok(event.clone())).is_ok());
            state.handlers.get(&event_type).cloned().unwrap_or_default()
        };

        trace!(id = %event.id, event_type = %event_type, handlers = handlers.len(), "event appended");
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn open_stream(&self, event_type: &str, live: bool) -> EventStream {
        let mut state = self.state.lock();
        let history: Vec<Result<LogEvent, IdentityError>> = state
            .events
            .iter()
            .filter(|e| e.event_type() == Some(event_type))
            .cloned()
            .map(Ok)
            .collect();

        if !live {
            return stream::iter(history).boxed();
        }

        // Registered under the same lock as the snapshot, so nothing falls between.
        let (tx, rx) = mpsc::unbounded_channel();
        state.taps.push(Tap {
            event_type: event_type.to_string(),
            tx,
        });
        stream::iter(history)
            .chain(UnboundedReceiverStream::new(rx))
            .boxed()
    }

    /// Snapshot of the full history in append order.
    pub fn history(&self) -> Vec<LogEvent> {
        self.state.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    /// Bytes of a blob stored through this log.
    pub fn blob(&self, link: &str) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(link).cloned()
    }
}

#[async_trait]
impl EventSource for MemoryLog {
    async fn stream_by_type(&self, event_type: &str, live: bool) -> Result<EventStream, IdentityError> {
        Ok(self.open_stream(event_type, live))
    }

    async fn stream_identity_events(&self) -> Result<EventStream, IdentityError> {
        Ok(self.open_stream(ABOUT_TYPE, true))
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<(), IdentityError> {
        let author = self.local_key.clone();
        self.append(&author, event_type, payload).await.map(|_| ())
    }

    async fn store_blob(&self, file: &ImageFile) -> Result<String, IdentityError> {
        let link = blob_link(&file.bytes);
        if let Some(journal) = &self.journal {
            journal
                .write_blob(&file.bytes)
                .await
                .map_err(|e| IdentityError::BlobStorage(e.to_string()))?;
        }
        self.state.lock().blobs.insert(link.clone(), file.bytes.clone());
        debug!(link = %link, size = file.size(), "blob stored");
        Ok(link)
    }

    fn local_identity_key(&self) -> &str {
        &self.local_key
    }

    fn register_handlers(&self, handlers: HandlerMap) {
        let mut state = self.state.lock();
        for (event_type, handler) in handlers {
            state.handlers.entry(event_type).or_default().push(handler);
        }
    }
}
