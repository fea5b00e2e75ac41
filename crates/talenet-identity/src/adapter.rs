//! Identity adapter: wires an [`EventSource`] into the projection and exposes
//! the public read, subscribe and publish API.
//!
//! All folding, store writes and propagation happen on one engine task, which
//! selects over:
//! 1. the live `about` stream from the source,
//! 2. a command channel fed by API calls, the live skill assignment handler
//!    and backfill scans,
//! 3. the shutdown signal.
//!
//! Publishing never touches the store; a published change becomes visible
//! when it comes back through the source and is folded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::registry::{Callback, Scope, SubscriptionHandle, SubscriptionRegistry};
use crate::source::{EventHandler, EventSource, EventStream};
use crate::store::IdentityStore;
use crate::{
    ABOUT_TYPE, AboutContent, AdapterConfig, Identity, IdentityError, ImageFile, ImageRef, LogEvent,
    Projection, SkillAction, SkillAssignmentContent,
};

/// Work for the engine task.
enum Command {
    /// A newly appended event pushed by the source.
    Ingest(LogEvent),
    /// A historical event forwarded by a backfill scan.
    Backfill(LogEvent),
    /// Register an identity subscription and replay current state to it.
    Subscribe {
        keys: BTreeSet<String>,
        callback: Callback<Identity>,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    /// Every event of a backfill scan has been queued ahead of this.
    BackfillDone {
        report: BackfillReport,
        replies: Vec<BackfillReply>,
    },
}

type BackfillReply = oneshot::Sender<Result<BackfillReport, IdentityError>>;

/// Sender half of the running engine's command channel, `None` while stopped.
type CommandSlot = Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<Command>>>>;

/// Outcome of a skill assignment backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Assignment events read from history.
    pub scanned: usize,
    /// Of those, events authored by one of the subscribed keys.
    pub matched: usize,
}

/// Completion signal of a backfill started by `subscribe_identities`.
#[derive(Debug)]
pub struct Backfill {
    rx: oneshot::Receiver<Result<BackfillReport, IdentityError>>,
}

impl Backfill {
    /// Wait until every matching historical assignment has been folded.
    ///
    /// Fails with [`IdentityError::Disconnected`] if the engine stops first.
    pub async fn wait(self) -> Result<BackfillReport, IdentityError> {
        self.rx.await.map_err(|_| IdentityError::Disconnected)?
    }
}

/// Result of `subscribe_identities`.
#[derive(Debug)]
pub struct IdentitySubscription {
    pub handle: SubscriptionHandle,
    pub backfill: Backfill,
}

/// Reads and publishes identity data over an [`EventSource`].
pub struct IdentityAdapter {
    source: Arc<dyn EventSource>,
    config: AdapterConfig,
    projection: Arc<Projection>,
    own_key_subscriptions: Arc<SubscriptionRegistry<String>>,
    commands: CommandSlot,
    engine: Mutex<Option<JoinHandle<()>>>,
    /// Every key ever passed to `subscribe_identities`, re-backfilled on connect.
    tracked: parking_lot::Mutex<BTreeSet<String>>,
    /// Backfills requested while stopped, answered by the next connect.
    deferred: parking_lot::Mutex<Vec<BackfillReply>>,
    handlers_registered: AtomicBool,
    /// Shutdown signal of the running engine.
    shutdown_tx: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl IdentityAdapter {
    /// Create an adapter with its own store and registries.
    pub fn new(source: Arc<dyn EventSource>, config: AdapterConfig) -> Self {
        let projection = Projection::new(
            IdentityStore::new(),
            SubscriptionRegistry::new(Scope::Identities),
            config.skill_assignment_type(),
        );
        Self::with_projection(source, config, projection)
    }

    /// Create an adapter around an existing projection.
    pub fn with_projection(source: Arc<dyn EventSource>, config: AdapterConfig, projection: Projection) -> Self {
        Self {
            source,
            config,
            projection: Arc::new(projection),
            own_key_subscriptions: SubscriptionRegistry::new(Scope::OwnIdentityKey),
            commands: Arc::new(parking_lot::Mutex::new(None)),
            engine: Mutex::new(None),
            tracked: parking_lot::Mutex::new(BTreeSet::new()),
            deferred: parking_lot::Mutex::new(Vec::new()),
            handlers_registered: AtomicBool::new(false),
            shutdown_tx: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.commands.lock().is_some()
    }

    fn command_sender(&self) -> Option<mpsc::UnboundedSender<Command>> {
        self.commands.lock().clone()
    }

    /// Start ingesting.
    ///
    /// Resolves as soon as the identity stream is open; history keeps being
    /// folded in the background. Every key subscribed so far is backfilled
    /// again, which also answers backfills requested while stopped.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), IdentityError> {
        let mut engine = self.engine.lock().await;
        if engine.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(IdentityError::AlreadyConnected);
        }
        if let Some(finished) = engine.take() {
            if let Err(e) = finished.await {
                error!(error = %e, "previous identity engine panicked");
            }
        }

        let events = self.source.stream_identity_events().await.map_err(|e| match e {
            IdentityError::SourceUnavailable(_) => e,
            other => IdentityError::SourceUnavailable(other.to_string()),
        })?;

        if !self.handlers_registered.swap(true, Ordering::SeqCst) {
            let commands = Arc::clone(&self.commands);
            let handler: EventHandler = Arc::new(move |event: LogEvent| {
                let sent = commands
                    .lock()
                    .as_ref()
                    .is_some_and(|tx| tx.send(Command::Ingest(event)).is_ok());
                if !sent {
                    // Recovered by the backfill of the next connect.
                    trace!("engine stopped, dropping pushed event");
                }
            });
            self.source
                .register_handlers(HashMap::from([(self.config.skill_assignment_type(), handler)]));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(commands_tx.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let runner = Engine {
            projection: Arc::clone(&self.projection),
            commands: Arc::clone(&self.commands),
            own_sender: commands_tx.clone(),
        };
        *engine = Some(tokio::spawn(runner.run(events, commands_rx, shutdown_rx)));

        let keys: HashSet<String> = self.tracked.lock().iter().cloned().collect();
        let replies = std::mem::take(&mut *self.deferred.lock());
        if !keys.is_empty() || !replies.is_empty() {
            self.spawn_backfill(commands_tx, keys, replies);
        }

        info!(own_key = %self.own_identity_key(), "identity adapter connected");
        Ok(())
    }

    /// Stop the engine task and wait for it to exit. Requests still queued
    /// fail with [`IdentityError::Disconnected`]. `connect` may be called
    /// again afterwards; store and subscriptions are kept.
    pub async fn shutdown(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            shutdown_tx.send_replace(true);
        }
        let running = self.engine.lock().await.take();
        if let Some(handle) = running {
            if let Err(e) = handle.await {
                error!(error = %e, "identity engine panicked");
            }
        }
    }

    /// Key of the local identity.
    pub fn own_identity_key(&self) -> &str {
        self.source.local_identity_key()
    }

    /// Current folded state of `key` (a default identity if nothing is known).
    pub fn identity(&self, key: &str) -> Identity {
        self.projection.store().get(key)
    }

    /// Subscribe to the own identity key. `on_update` is called with the
    /// current key before this returns.
    pub fn subscribe_own_identity_key<F>(&self, on_update: F) -> SubscriptionHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: Callback<String> = Arc::new(move |key: &String| on_update(key));
        let handle = self.own_key_subscriptions.subscribe(None, callback);

        // Switching identities is not supported, so the key never changes after this.
        let own_key = self.own_identity_key().to_string();
        self.own_key_subscriptions.deliver(&handle, &own_key, &own_key);
        handle
    }

    /// Subscribe to a set of identities.
    ///
    /// The current state of every key is replayed to `on_update` before this
    /// resolves. A backfill of historical skill assignments for those keys
    /// runs in the background; skills are only complete once
    /// `subscription.backfill` resolves. While the engine is stopped the
    /// subscription is registered directly and its backfill waits for the
    /// next `connect`.
    #[tracing::instrument(skip(self, on_update, identity_keys))]
    pub async fn subscribe_identities<F, I, K>(&self, on_update: F, identity_keys: I) -> IdentitySubscription
    where
        F: Fn(&Identity) + Send + Sync + 'static,
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: BTreeSet<String> = identity_keys.into_iter().map(Into::into).collect();
        self.tracked.lock().extend(keys.iter().cloned());
        let callback: Callback<Identity> = Arc::new(on_update);

        if let Some(commands_tx) = self.command_sender() {
            let (reply, reply_rx) = oneshot::channel();
            let queued = commands_tx
                .send(Command::Subscribe {
                    keys: keys.clone(),
                    callback: Arc::clone(&callback),
                    reply,
                })
                .is_ok();
            if queued {
                if let Ok(handle) = reply_rx.await {
                    let (backfill_reply, rx) = oneshot::channel();
                    self.spawn_backfill(commands_tx, keys.into_iter().collect(), vec![backfill_reply]);
                    return IdentitySubscription {
                        handle,
                        backfill: Backfill { rx },
                    };
                }
            }
            debug!("engine stopped before registering, subscribing directly");
        }

        let handle = register_and_replay(&self.projection, &keys, callback);
        let (backfill_reply, rx) = oneshot::channel();
        self.deferred.lock().push(backfill_reply);
        IdentitySubscription {
            handle,
            backfill: Backfill { rx },
        }
    }

    /// Cancel a subscription of either scope. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    fn spawn_backfill(
        &self,
        commands_tx: mpsc::UnboundedSender<Command>,
        keys: HashSet<String>,
        replies: Vec<BackfillReply>,
    ) {
        let source = Arc::clone(&self.source);
        let skill_type = self.config.skill_assignment_type();

        tokio::spawn(async move {
            match scan_assignments(source.as_ref(), &skill_type, &keys, &commands_tx).await {
                Ok(report) => {
                    if commands_tx.send(Command::BackfillDone { report, replies }).is_err() {
                        trace!("engine stopped before backfill completed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skill assignment backfill failed");
                    for reply in replies {
                        let failure = match &e {
                            IdentityError::Disconnected => IdentityError::Disconnected,
                            other => IdentityError::SourceUnavailable(other.to_string()),
                        };
                        if reply.send(Err(failure)).is_err() {
                            trace!("backfill result dropped");
                        }
                    }
                }
            }
        });
    }

    /// Publish a name for `identity_key`. Returns the key once appended.
    #[tracing::instrument(skip(self))]
    pub async fn set_identity_name(&self, identity_key: &str, name: &str) -> Result<String, IdentityError> {
        let payload = serde_json::to_value(AboutContent::name(identity_key, name))?;
        self.publish(ABOUT_TYPE, payload).await?;
        Ok(identity_key.to_string())
    }

    /// Store `file` as a blob, then publish it as the image of `identity_key`.
    ///
    /// If storage fails nothing is published. If publishing fails the stored
    /// blob is left unreferenced.
    #[tracing::instrument(skip(self, file), fields(size = file.size(), mime_type = %file.mime_type))]
    pub async fn set_identity_image(&self, identity_key: &str, file: &ImageFile) -> Result<String, IdentityError> {
        let link = self.source.store_blob(file).await.map_err(|e| match e {
            IdentityError::BlobStorage(_) => e,
            other => IdentityError::BlobStorage(other.to_string()),
        })?;

        let image = ImageRef {
            link,
            size: file.size(),
            mime_type: file.mime_type.clone(),
        };
        let payload = serde_json::to_value(AboutContent::image(identity_key, image))?;
        self.publish(ABOUT_TYPE, payload).await?;
        Ok(identity_key.to_string())
    }

    /// Publish an assignment of `skill_key` to the own identity.
    pub async fn assign_skill_to_identity(&self, skill_key: &str) -> Result<String, IdentityError> {
        self.update_skill_assignment(skill_key, SkillAction::Assign).await
    }

    /// Publish an unassignment of `skill_key` from the own identity.
    pub async fn unassign_skill_from_identity(&self, skill_key: &str) -> Result<String, IdentityError> {
        self.update_skill_assignment(skill_key, SkillAction::Unassign).await
    }

    #[tracing::instrument(skip(self))]
    async fn update_skill_assignment(&self, skill_key: &str, action: SkillAction) -> Result<String, IdentityError> {
        let payload = serde_json::to_value(SkillAssignmentContent {
            skill_key: skill_key.to_string(),
            action: action.as_str().to_string(),
        })?;
        self.publish(&self.config.skill_assignment_type(), payload).await?;
        Ok(skill_key.to_string())
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<(), IdentityError> {
        self.source
            .publish(event_type, payload)
            .await
            .map_err(|e| match e {
                IdentityError::Publish { .. } => e,
                other => IdentityError::Publish {
                    event_type: event_type.to_string(),
                    reason: other.to_string(),
                },
            })?;
        debug!(event_type = %event_type, "published");
        Ok(())
    }
}

async fn scan_assignments(
    source: &dyn EventSource,
    skill_type: &str,
    keys: &HashSet<String>,
    commands_tx: &mpsc::UnboundedSender<Command>,
) -> Result<BackfillReport, IdentityError> {
    let mut history = source.stream_by_type(skill_type, false).await?;
    let mut report = BackfillReport::default();

    while let Some(event) = history.next().await {
        let event = event?;
        report.scanned += 1;
        if keys.contains(&event.author) {
            report.matched += 1;
            commands_tx
                .send(Command::Backfill(event))
                .map_err(|_| IdentityError::Disconnected)?;
        }
    }

    Ok(report)
}

/// Register `callback` for `keys` and replay the current state of each key
/// to it alone.
fn register_and_replay(
    projection: &Projection,
    keys: &BTreeSet<String>,
    callback: Callback<Identity>,
) -> SubscriptionHandle {
    let subscriptions = projection.subscriptions();
    let handle = subscriptions.subscribe(Some(keys.iter().cloned().collect()), callback);
    for key in keys {
        let identity = projection.store().get(key);
        subscriptions.deliver(&handle, key, &identity);
    }
    handle
}

/// Owns the single thread of folding for one connection.
struct Engine {
    projection: Arc<Projection>,
    commands: CommandSlot,
    /// Identifies this connection's channel in `commands`.
    own_sender: mpsc::UnboundedSender<Command>,
}

impl Engine {
    async fn run(
        self,
        mut events: EventStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("identity engine started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("identity engine shutting down");
                        break;
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }

                event = events.next() => {
                    match event {
                        Some(Ok(event)) => {
                            self.projection.fold_logged(&event);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "identity stream error");
                        }
                        None => {
                            info!("identity stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // Dropping the receiver fails every queued reply and every later send.
        {
            let mut slot = self.commands.lock();
            if slot.as_ref().is_some_and(|tx| tx.same_channel(&self.own_sender)) {
                slot.take();
            }
        }
        commands.close();
        let dropped = std::iter::from_fn(|| commands.try_recv().ok()).count();
        debug!(dropped, "identity engine stopped");
    }

    fn handle_command(&self, command: Command) {
        match command {
            Command::Ingest(event) | Command::Backfill(event) => {
                self.projection.fold_logged(&event);
            }
            Command::Subscribe { keys, callback, reply } => {
                let handle = register_and_replay(&self.projection, &keys, callback);
                if let Err(handle) = reply.send(handle) {
                    debug!("subscriber went away before registration completed");
                    handle.unsubscribe();
                }
            }
            Command::BackfillDone { report, replies } => {
                debug!(scanned = report.scanned, matched = report.matched, "backfill complete");
                for reply in replies {
                    if reply.send(Ok(report)).is_err() {
                        trace!("backfill completion not awaited");
                    }
                }
            }
        }
    }
}
