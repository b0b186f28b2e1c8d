//! The application-root context UI bindings talk to.
//!
//! A [`SyncContext`] is built once with [`SyncContext::init`] (load from
//! disk, start the background loop) and torn down with
//! [`SyncContext::shutdown`] (stop the loop, flush). Components borrow it to
//! open [`QueryHandle`]s and [`MutationHandle`]s.

use crate::clock::SystemClock;
use crate::config::Config;
use crate::coordinator::SyncCoordinator;
use crate::error::Result;
use crate::gateway::{Gateway, Subscription};
use crate::network::NetworkMonitor;
use crate::persistence::{FileStore, MemoryStore, PersistWriter, PersistentStore};
use harbor_engine::{
    CacheEntry, Clock, Mutation, MutationId, MutationRecord, MutationStatus, Notice, Observer,
    QueryDescriptor, QueryKey, QueryView, Schema, SnapshotMetadata, Store, SubscriptionId,
    SyncState, Timestamp,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct SyncContext {
    coordinator: SyncCoordinator,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    realtime: Mutex<Vec<Subscription>>,
}

impl SyncContext {
    /// Open with the system clock and the store `config.state_path` names.
    pub async fn init(config: Config, gateway: Arc<dyn Gateway>) -> Self {
        let persistence: Arc<dyn PersistentStore> = match &config.state_path {
            Some(path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        Self::open(config, gateway, persistence, Arc::new(SystemClock)).await
    }

    /// Load persisted state and start the background loop.
    ///
    /// A document that cannot be read is logged and replaced by an empty
    /// state. The context starts offline until told otherwise.
    pub async fn open(
        config: Config,
        gateway: Arc<dyn Gateway>,
        persistence: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = load(&config, persistence.as_ref(), clock.now()).await;
        let writer = PersistWriter::spawn(persistence);
        let coordinator =
            SyncCoordinator::new(store, gateway, writer, clock, config, NetworkMonitor::new(false));

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));
        Self {
            coordinator,
            shutdown,
            task: Mutex::new(Some(task)),
            realtime: Mutex::new(Vec::new()),
        }
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn network(&self) -> &NetworkMonitor {
        self.coordinator.network()
    }

    // ---- queries ----

    /// Watch a query for as long as the handle lives.
    ///
    /// The handle shows cached data right away; a fetch starts in the
    /// background when the data is missing or stale and the network is up.
    pub fn use_query(&self, descriptor: impl Into<QueryDescriptor>) -> QueryHandle {
        let descriptor = descriptor.into();
        let key = descriptor.key.clone();
        let (tx, rx) = watch::channel(QueryView::default());
        let tx = Arc::new(tx);

        let observer: Observer = {
            let tx = Arc::clone(&tx);
            let clock = Arc::clone(self.coordinator.clock());
            Arc::new(move |entry: &CacheEntry| {
                tx.send_replace(entry.view(clock.now()));
            })
        };

        let now = self.coordinator.now();
        let (id, view, needs_fetch) = {
            let mut store = self.coordinator.store();
            let id = store.subscribe(&descriptor, observer, now);
            let needs_fetch = store
                .cache()
                .get(&key)
                .map_or(true, |entry| entry.is_stale(now) && !entry.is_fetching());
            (id, store.view(&key, now), needs_fetch)
        };
        tx.send_replace(view);

        if needs_fetch && self.coordinator.is_online() {
            self.spawn_fetch(key.clone());
        }
        self.coordinator.wake();
        QueryHandle {
            key,
            id,
            rx,
            coordinator: self.coordinator.clone(),
        }
    }

    /// Current view of `key` without subscribing.
    pub fn view(&self, key: &QueryKey) -> QueryView {
        let now = self.coordinator.now();
        self.coordinator.store().view(key, now)
    }

    /// Mark `key` stale and fetch it now if online.
    pub async fn refetch(&self, key: &QueryKey) -> bool {
        self.coordinator.store().invalidate(key);
        if !self.coordinator.is_online() {
            return false;
        }
        self.coordinator.fetch(key).await
    }

    /// Mark `key` stale; a watched key is refetched in the background.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let watched = self.coordinator.store().invalidate(key);
        if watched && self.coordinator.is_online() {
            self.spawn_fetch(key.clone());
        }
        watched
    }

    /// Invalidate every key under `prefix`. Returns the watched ones, which
    /// are refetched in the background.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let watched = self.coordinator.store().invalidate_prefix(prefix);
        if self.coordinator.is_online() {
            for key in &watched {
                self.spawn_fetch(key.clone());
            }
        }
        watched
    }

    fn spawn_fetch(&self, key: QueryKey) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.fetch(&key).await;
        });
    }

    /// Apply the gateway's real-time changes under `prefix` until shutdown.
    pub fn subscribe_realtime(&self, prefix: &QueryKey) {
        let subscription = self
            .coordinator
            .gateway()
            .subscribe(prefix, self.coordinator.push_handler());
        self.realtime.lock().push(subscription);
    }

    // ---- mutations ----

    /// A handle bound to one kind of mutation: `build` turns the payload
    /// passed to [`MutationHandle::mutate`] into the typed mutation.
    ///
    /// ```rust,no_run
    /// # use harbor_client::SyncContext;
    /// # use harbor_engine::Mutation;
    /// # fn demo(context: &SyncContext) {
    /// let confirm = context.use_mutation(|(id, base_version): (String, u64)| {
    ///     Mutation::ConfirmAppointment { id, base_version }
    /// });
    /// # }
    /// ```
    pub fn use_mutation<P>(
        &self,
        build: impl Fn(P) -> Mutation + Send + Sync + 'static,
    ) -> MutationHandle<P> {
        MutationHandle {
            coordinator: self.coordinator.clone(),
            build: Box::new(build),
            last: Mutex::new(None),
        }
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationId> {
        self.coordinator.mutate(mutation).await
    }

    pub async fn retry_mutation(&self, id: MutationId) -> Result<()> {
        self.coordinator.retry(id).await
    }

    pub async fn discard_mutation(&self, id: MutationId) -> Result<MutationRecord> {
        self.coordinator.discard(id).await
    }

    /// A queued mutation, while the queue still holds it.
    pub fn mutation(&self, id: MutationId) -> Option<MutationRecord> {
        self.coordinator.store().queue().get(id).cloned()
    }

    /// Mutations waiting on the user.
    pub fn failed_mutations(&self) -> Vec<MutationRecord> {
        self.coordinator.store().queue().failed().cloned().collect()
    }

    // ---- sync state ----

    pub fn sync_state(&self) -> SyncState {
        self.coordinator.store().sync_state()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.coordinator.store().notices().to_vec()
    }

    pub fn dismiss_notice(&self, id: Uuid) -> bool {
        self.coordinator.store().dismiss(id)
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.coordinator.set_online(online)
    }

    pub fn durability_degraded(&self) -> bool {
        self.coordinator.durability_degraded()
    }

    /// Deliver whatever is due and wait for the results.
    pub async fn sync_now(&self) -> Result<usize> {
        self.coordinator.sync_now().await
    }

    /// Stop the background loop, drop real-time subscriptions and write the
    /// final state. Returns the error of that last write, if any.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down; flushing state");
        self.realtime.lock().clear();
        let _ = self.shutdown.send(true);
        self.coordinator.close();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Sync loop panicked: {}", e);
            }
        }
        let flushed = self.coordinator.flush().await;
        self.coordinator.close_writer().await;
        flushed
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.coordinator.close();
    }
}

async fn load(config: &Config, persistence: &dyn PersistentStore, now: Timestamp) -> Store {
    let mut store = Store::new(Schema::default(), config.store_config());
    match persistence.load().await {
        Ok(Some(state)) => {
            let meta = SnapshotMetadata::from(&state);
            match store.import_state(state, now) {
                Ok(()) => tracing::info!(
                    entries = meta.entry_count,
                    pending = meta.pending_count,
                    failed = meta.failed_count,
                    "Restored persisted state"
                ),
                Err(e) => tracing::warn!("Persisted state rejected; starting empty: {}", e),
            }
        }
        Ok(None) => tracing::info!("No persisted state; starting empty"),
        Err(e) => tracing::warn!(error = %e, "Could not load persisted state; starting empty"),
    }
    store
}

/// A live query. Dropping it unsubscribes.
pub struct QueryHandle {
    key: QueryKey,
    id: SubscriptionId,
    rx: watch::Receiver<QueryView>,
    coordinator: SyncCoordinator,
}

impl QueryHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn view(&self) -> QueryView {
        self.rx.borrow().clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.rx.borrow().data.clone()
    }

    /// Wait for the next change. `None` once the cache dropped the observer.
    pub async fn changed(&mut self) -> Option<QueryView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the view satisfies `pred`, which may already be the case.
    pub async fn wait_for(&mut self, pred: impl FnMut(&QueryView) -> bool) -> Option<QueryView> {
        let view = self.rx.wait_for(pred).await.ok()?;
        Some((*view).clone())
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        let now = self.coordinator.now();
        self.coordinator.store().unsubscribe(self.id, now);
    }
}

/// Where the last mutation issued through a [`MutationHandle`] stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    /// Still in the queue
    Queued(MutationStatus),
    /// Committed, or dropped with a notice
    Settled,
}

/// Issues one kind of mutation from its payload and tracks the most recent.
pub struct MutationHandle<P> {
    coordinator: SyncCoordinator,
    build: Box<dyn Fn(P) -> Mutation + Send + Sync>,
    last: Mutex<Option<MutationId>>,
}

impl<P> MutationHandle<P> {
    pub async fn mutate(&self, payload: P) -> Result<MutationId> {
        let id = self.coordinator.mutate((self.build)(payload)).await?;
        *self.last.lock() = Some(id);
        Ok(id)
    }

    pub fn last_id(&self) -> Option<MutationId> {
        *self.last.lock()
    }

    pub fn status(&self) -> MutationState {
        let Some(id) = self.last_id() else {
            return MutationState::Idle;
        };
        match self.coordinator.store().queue().get(id) {
            Some(record) => MutationState::Queued(record.status),
            None => MutationState::Settled,
        }
    }
}
