//! The state store - single source of truth for application state.
//!
//! The store owns one canonical state value and serializes every write
//! through the same pipeline: resolve the update, deep-merge it into a
//! candidate state, run the middleware before-phase (which may transform or
//! veto), commit, notify subscribers, run the after-phase, enqueue a
//! persistence write, and record the transition for devtools.
//!
//! Reads are cheap snapshots: state is held as an `Arc` swapped atomically
//! on commit, so a snapshot handed out earlier is never mutated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapter::StorageAdapter;
use crate::binding::StoreHandle;
use crate::devtools::{unix_millis, Recorder, TransitionRecord};
use crate::error::{Result, StateError};
use crate::listener::{Registry, Subscription};
use crate::merge::{deep_merge, Equality, Patch};
use crate::middleware::{BeforeOutcome, Middleware, MiddlewareId, Pipeline, Transition};
use crate::migrate::{Migration, Migrator};
use crate::stream::{ChangeSender, StateChange, StateStream};

/// Bound on the state type: JSON-shaped, cloneable, shareable.
pub trait State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A requested change: a ready-made patch or a function of current state.
pub enum Update<S> {
    /// Merge this partial value into the state.
    Patch(Patch),
    /// Compute the partial value from the current state.
    With(Box<dyn FnOnce(&S) -> Patch + Send>),
}

impl<S> Update<S> {
    /// An update computed from the current state.
    pub fn with(f: impl FnOnce(&S) -> Patch + Send + 'static) -> Self {
        Update::With(Box::new(f))
    }
}

impl<S> From<Patch> for Update<S> {
    fn from(patch: Patch) -> Self {
        Update::Patch(patch)
    }
}

impl<S> From<Value> for Update<S> {
    fn from(value: Value) -> Self {
        Update::Patch(Patch::from(value))
    }
}

/// When subscribers hear about commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    /// Coalesce all commits of the current task burst into one deferred
    /// notification carrying the latest state. Middleware still runs once
    /// per update. Without an ambient Tokio runtime delivery degrades to
    /// inline notification at each commit.
    #[default]
    Batched,
    /// Notify inline at every commit.
    Immediate,
}

/// Shape of a persisted snapshot. Stable across implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub version: u64,
    pub data: Value,
}

/// Persistence configuration for a store.
pub struct PersistConfig {
    pub adapter: Arc<dyn StorageAdapter>,
    /// Key the storage record lives under.
    pub key: String,
    /// Current schema version, written with every record.
    pub version: u64,
    /// Upgrade chain for older persisted records.
    pub migrations: Vec<Migration>,
}

enum PersistCommand {
    Write(String),
    Drain(oneshot::Sender<()>),
}

struct PersistHandle {
    queue: mpsc::UnboundedSender<PersistCommand>,
    adapter: Arc<dyn StorageAdapter>,
    key: String,
    version: u64,
}

pub(crate) struct StoreInner<S> {
    state: RwLock<Arc<S>>,
    /// State as of store creation, before hydration. Serves pre-hydration
    /// (server) renders.
    initial: Arc<S>,
    pipeline: Pipeline<S>,
    listeners: Arc<Registry<S>>,
    changes: ChangeSender<S>,
    recorder: Option<Recorder>,
    notify_mode: NotifyMode,
    notify_pending: AtomicBool,
    persist: Option<PersistHandle>,
}

/// The application state container.
pub struct Store<S> {
    pub(crate) inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: State> Store<S> {
    /// Start building a store around an initial state.
    pub fn builder(initial: S) -> StoreBuilder<S> {
        StoreBuilder::new(initial)
    }

    /// Current state snapshot. No side effects; never blocks beyond the
    /// internal read lock.
    pub fn state(&self) -> Arc<S> {
        self.inner.state.read().clone()
    }

    /// State as of store creation, before any hydration or commit.
    pub fn server_state(&self) -> Arc<S> {
        self.inner.initial.clone()
    }

    /// Apply an update synchronously.
    ///
    /// Fatal errors (merge failure, before-phase error, veto) leave the
    /// state unchanged and surface here; after-phase and persistence
    /// failures are contained and never reach the caller.
    pub fn set(&self, update: impl Into<Update<S>>) -> Result<()> {
        self.apply(update.into(), None)
    }

    /// Apply an update with a human-readable tag for logs and devtools.
    pub fn set_with_meta(
        &self,
        update: impl Into<Update<S>>,
        meta: impl Into<String>,
    ) -> Result<()> {
        self.apply(update.into(), Some(meta.into()))
    }

    /// Apply an update produced asynchronously.
    ///
    /// The patch is computed from a snapshot taken now but applied against
    /// whatever state is canonical once the future resolves: concurrent
    /// calls have no mutual ordering and the last to apply wins. There is
    /// no cancellation; dropping interest in the result does not stop the
    /// commit.
    pub async fn set_async<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: std::future::Future<Output = Patch>,
    {
        let snapshot = self.state();
        let patch = f(snapshot).await;
        self.apply(Update::Patch(patch), None)
    }

    fn apply(&self, update: Update<S>, meta: Option<String>) -> Result<()> {
        let started = Instant::now();
        let prev = self.state();

        let patch = match update {
            Update::Patch(patch) => patch,
            Update::With(f) => f(&prev),
        };

        let prev_value = serde_json::to_value(&*prev)?;
        let next_value = deep_merge(&prev_value, &patch);
        let next: S =
            serde_json::from_value(next_value).map_err(|e| StateError::Merge(e.to_string()))?;

        let transition = Transition {
            prev: prev.clone(),
            next,
            meta,
            at: SystemTime::now(),
        };
        let transition = match self.inner.pipeline.before(transition)? {
            BeforeOutcome::Continue(t) => t,
            BeforeOutcome::Veto(id) => {
                debug!(middleware = %id, "transition vetoed");
                return Err(StateError::Vetoed { id });
            }
        };

        let meta = transition.meta;
        let at = transition.at;
        let committed = Arc::new(transition.next);
        *self.inner.state.write() = committed.clone();

        match self.inner.notify_mode {
            NotifyMode::Immediate => self.inner.listeners.notify(&committed),
            NotifyMode::Batched => self.schedule_flush(),
        }
        self.inner.changes.send(StateChange {
            state: committed.clone(),
            meta: meta.clone(),
            at,
        });

        self.inner.pipeline.after(&committed);

        // Committed-state JSON feeds both persistence and devtools; skip the
        // serialization entirely when neither is configured.
        if self.inner.persist.is_some() || self.inner.recorder.is_some() {
            match serde_json::to_value(&*committed) {
                Ok(committed_value) => {
                    self.enqueue_persist(&committed_value);
                    if let Some(recorder) = &self.inner.recorder {
                        recorder.on_transition(TransitionRecord {
                            kind: meta,
                            payload: patch,
                            prev_state: prev_value,
                            next_state: committed_value,
                            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                            timestamp: unix_millis(at),
                        });
                    }
                }
                Err(err) => warn!(error = %err, "committed state failed to serialize"),
            }
        }

        Ok(())
    }

    fn enqueue_persist(&self, committed_value: &Value) {
        let Some(persist) = &self.inner.persist else {
            return;
        };
        let record = StorageRecord {
            version: persist.version,
            data: committed_value.clone(),
        };
        match serde_json::to_string(&record) {
            Ok(text) => {
                let _ = persist.queue.send(PersistCommand::Write(text));
            }
            Err(err) => warn!(error = %err, "storage record failed to serialize"),
        }
    }

    fn schedule_flush(&self) {
        if self.inner.notify_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    flush(&inner);
                });
            }
            // No runtime to defer onto; deliver inline instead of panicking.
            Err(_) => flush(&self.inner),
        }
    }

    /// Deliver any pending batched notification now. No-op when nothing is
    /// pending or in immediate mode.
    pub fn flush_notifications(&self) {
        flush(&self.inner);
    }

    /// Subscribe to every committed transition.
    pub fn subscribe(&self, listener: impl Fn(&Arc<S>) + Send + Sync + 'static) -> Subscription<S> {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Subscribe through a selector: the downstream callback only re-fires
    /// when the selected slice changes under `equality`.
    pub fn subscribe_selector<F, G>(
        &self,
        selector: F,
        equality: Equality,
        downstream: G,
    ) -> Subscription<S>
    where
        F: Fn(&S) -> Value + Send + Sync + 'static,
        G: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add_selector(selector, equality, downstream)
    }

    /// Prune dead listener slots.
    pub fn cleanup_listeners(&self) {
        self.inner.listeners.cleanup()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Open an async stream of committed transitions.
    pub fn watch(&self) -> StateStream<S> {
        self.inner.changes.subscribe()
    }

    /// Register a middleware. Higher priority runs earlier.
    pub fn add_middleware(
        &self,
        middleware: Arc<dyn Middleware<S>>,
        priority: i32,
    ) -> MiddlewareId {
        self.inner.pipeline.add(middleware, priority)
    }

    pub fn remove_middleware(&self, id: MiddlewareId) {
        self.inner.pipeline.remove(id)
    }

    pub fn clear_middleware(&self) {
        self.inner.pipeline.clear()
    }

    /// The devtools recorder, when enabled.
    pub fn recorder(&self) -> Option<&Recorder> {
        self.inner.recorder.as_ref()
    }

    /// Replace canonical state wholesale (devtools import). Bypasses the
    /// middleware pipeline, notifies subscribers, persists, and clears
    /// recorded history.
    pub fn import_state(&self, value: Value) -> Result<()> {
        let next: S =
            serde_json::from_value(value.clone()).map_err(|e| StateError::Merge(e.to_string()))?;
        let committed = Arc::new(next);
        *self.inner.state.write() = committed.clone();

        match self.inner.notify_mode {
            NotifyMode::Immediate => self.inner.listeners.notify(&committed),
            NotifyMode::Batched => self.schedule_flush(),
        }
        self.enqueue_persist(&value);
        if let Some(recorder) = &self.inner.recorder {
            recorder.reset();
        }
        Ok(())
    }

    /// Wait until every persistence write enqueued so far has reached the
    /// adapter. No-op without persistence.
    pub async fn sync(&self) {
        let Some(persist) = &self.inner.persist else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if persist.queue.send(PersistCommand::Drain(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Serialize and write the current state to the adapter immediately,
    /// surfacing any storage error to the caller.
    pub async fn persist_now(&self) -> Result<()> {
        let Some(persist) = &self.inner.persist else {
            return Ok(());
        };
        let record = StorageRecord {
            version: persist.version,
            data: serde_json::to_value(&*self.state())?,
        };
        let text = serde_json::to_string(&record)?;
        persist.adapter.set(&persist.key, &text).await
    }

    /// Remove the persisted record, if any.
    pub async fn clear_persisted(&self) -> Result<()> {
        let Some(persist) = &self.inner.persist else {
            return Ok(());
        };
        persist.adapter.remove(&persist.key).await
    }

    /// A weak handle for the UI-binding layer. Outlives the store safely:
    /// calls after the store is dropped fail with `ProviderMissing`.
    pub fn handle(&self) -> StoreHandle<S> {
        StoreHandle::new(Arc::downgrade(&self.inner))
    }
}

fn flush<S>(inner: &Arc<StoreInner<S>>) {
    // Clear the flag before reading state so a commit racing with this
    // flush re-schedules instead of being swallowed.
    if inner.notify_pending.swap(false, Ordering::AcqRel) {
        let state = inner.state.read().clone();
        inner.listeners.notify(&state);
    }
}

pub(crate) fn snapshot_of<S>(inner: &StoreInner<S>) -> Arc<S> {
    inner.state.read().clone()
}

pub(crate) fn server_snapshot_of<S>(inner: &StoreInner<S>) -> Arc<S> {
    inner.initial.clone()
}

pub(crate) fn listeners_of<S>(inner: &StoreInner<S>) -> &Arc<Registry<S>> {
    &inner.listeners
}

/// Configures and constructs a [`Store`].
pub struct StoreBuilder<S> {
    initial: S,
    middleware: Vec<(Arc<dyn Middleware<S>>, i32)>,
    persist: Option<PersistConfig>,
    devtools: Option<(usize, usize)>,
    notify_mode: NotifyMode,
    stream_capacity: usize,
}

impl<S: State> StoreBuilder<S> {
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            middleware: Vec::new(),
            persist: None,
            devtools: None,
            notify_mode: NotifyMode::default(),
            stream_capacity: 1024,
        }
    }

    /// Register a middleware at the given priority.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware<S>>, priority: i32) -> Self {
        self.middleware.push((middleware, priority));
        self
    }

    /// Persist committed state through the given adapter.
    pub fn persist(mut self, config: PersistConfig) -> Self {
        self.persist = Some(config);
        self
    }

    /// Enable the devtools recorder with the given action-log capacity and
    /// snapshot period (0 disables periodic snapshots).
    pub fn devtools(mut self, capacity: usize, snapshot_every: usize) -> Self {
        self.devtools = Some((capacity, snapshot_every));
        self
    }

    pub fn notify_mode(mut self, mode: NotifyMode) -> Self {
        self.notify_mode = mode;
        self
    }

    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Build without touching the adapter: persisted state is not loaded,
    /// but commits are persisted if persistence is configured. Must run
    /// inside a Tokio runtime when persistence is configured.
    pub fn build(self) -> Store<S> {
        self.assemble(None)
    }

    /// Build and hydrate from the adapter: a stored record at the current
    /// version overrides the initial state verbatim; an older record is
    /// migrated first. Corrupt payloads, adapter failures, future versions,
    /// and migration gaps all fall back to the initial state with a log,
    /// never an error.
    pub async fn load(self) -> Store<S> {
        let hydrated = match &self.persist {
            Some(config) => match hydrate(config, &self.initial).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(error = %err, "hydration failed, using initial state");
                    None
                }
            },
            None => None,
        };
        self.assemble(hydrated)
    }

    fn assemble(self, hydrated: Option<S>) -> Store<S> {
        let pipeline = Pipeline::new();
        for (middleware, priority) in self.middleware {
            pipeline.add(middleware, priority);
        }

        let persist = self.persist.map(|config| {
            let (queue, rx) = mpsc::unbounded_channel();
            spawn_writer(config.adapter.clone(), config.key.clone(), rx);
            PersistHandle {
                queue,
                adapter: config.adapter,
                key: config.key,
                version: config.version,
            }
        });

        let initial = Arc::new(self.initial);
        let state = hydrated.map(Arc::new).unwrap_or_else(|| initial.clone());

        Store {
            inner: Arc::new(StoreInner {
                state: RwLock::new(state),
                initial,
                pipeline,
                listeners: Arc::new(Registry::new()),
                changes: ChangeSender::new(self.stream_capacity),
                recorder: self
                    .devtools
                    .map(|(capacity, every)| Recorder::new(capacity, every)),
                notify_mode: self.notify_mode,
                notify_pending: AtomicBool::new(false),
                persist,
            }),
        }
    }
}

async fn hydrate<S: State>(config: &PersistConfig, initial: &S) -> Result<Option<S>> {
    let Some(text) = config.adapter.get(&config.key).await? else {
        debug!(key = %config.key, "no persisted record");
        return Ok(None);
    };

    let record: StorageRecord = serde_json::from_str(&text)
        .map_err(|e| StateError::Storage(format!("corrupt storage record: {e}")))?;

    let migrator = Migrator::new(config.version, config.migrations.iter().cloned());
    let data = migrator.migrate(record.version, record.data)?;

    // Persisted data overrides the initial state field by field.
    let base = serde_json::to_value(initial)?;
    let merged = deep_merge(&base, &Patch::from(data));
    let state: S = serde_json::from_value(merged).map_err(|e| StateError::Merge(e.to_string()))?;
    Ok(Some(state))
}

fn spawn_writer(
    adapter: Arc<dyn StorageAdapter>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                PersistCommand::Write(text) => {
                    if let Err(err) = adapter.set(&key, &text).await {
                        warn!(key = %key, error = %err, "persistence write failed");
                    }
                }
                PersistCommand::Drain(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
}
