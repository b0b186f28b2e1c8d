//! Sync Coordinator: drives the engine [`Store`] against the gateway.
//!
//! All engine state lives behind one lock that is only ever held for a
//! synchronous step. Gateway calls and disk writes happen with the lock
//! released, so a push or a new mutation may land while a delivery is
//! suspended; the engine's idempotency keys and rebase rule cover that.

use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::gateway::{Gateway, PushHandler};
use crate::network::NetworkMonitor;
use crate::persistence::PersistWriter;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use harbor_engine::clock::millis;
use harbor_engine::{
    Clock, GatewayError, Mutation, MutationAck, MutationId, MutationRecord, PushOutcome, QueryKey,
    Scheduler, Store, SyncOutcome, Timestamp,
};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

/// A pending cache save is pushed back at most this many debounce windows.
const MAX_SAVE_DELAY_WINDOWS: u64 = 5;

/// Timed work for the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// The earliest backoff deadline in the queue
    Retry,
    /// Periodic sync, staleness sweep and garbage collection
    Tick,
    /// Debounced cache save
    SaveCache,
    /// A watched query turns stale
    Refresh,
}

struct Shared {
    store: Mutex<Store>,
    gateway: Arc<dyn Gateway>,
    writer: PersistWriter,
    clock: Arc<dyn Clock>,
    config: Config,
    network: NetworkMonitor,
    scheduler: Mutex<Scheduler<Task>>,
    rng: Mutex<StdRng>,
    wake: Notify,
    /// K permits shared by every gateway call
    gateway_slots: Semaphore,
    /// Start of the current cache-save debounce window
    dirty_since: Mutex<Option<Timestamp>>,
    /// Clock reading of the last staleness sweep
    swept_at: AtomicU64,
    sync_requested: AtomicBool,
    refresh_requested: AtomicBool,
    /// One sync pass at a time
    sync_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl SyncCoordinator {
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        writer: PersistWriter,
        clock: Arc<dyn Clock>,
        config: Config,
        network: NetworkMonitor,
    ) -> Self {
        let slots = config.concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                gateway,
                writer,
                clock,
                config,
                network,
                scheduler: Mutex::new(Scheduler::new()),
                rng: Mutex::new(StdRng::from_entropy()),
                wake: Notify::new(),
                gateway_slots: Semaphore::new(slots),
                dirty_since: Mutex::new(None),
                swept_at: AtomicU64::new(0),
                sync_requested: AtomicBool::new(false),
                refresh_requested: AtomicBool::new(false),
                sync_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.shared.network
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.shared.gateway
    }

    /// Lock the engine. Never hold the guard across an await.
    pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
        self.shared.store.lock()
    }

    pub fn is_online(&self) -> bool {
        self.store().sync_state().is_online
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the last save failed and state currently lives only in memory.
    pub fn durability_degraded(&self) -> bool {
        self.shared.writer.is_degraded()
    }

    // ---- connectivity ----

    /// Record connectivity and react to it. Returns `true` on an offline to
    /// online transition, which flushes the queue and refreshes stale queries.
    pub fn set_online(&self, online: bool) -> bool {
        self.shared.network.set_online(online);
        self.apply_connectivity(online)
    }

    fn apply_connectivity(&self, online: bool) -> bool {
        let came_online = self.store().set_online(online);
        if came_online {
            tracing::info!("Back online; flushing mutation queue");
            self.shared.refresh_requested.store(true, Ordering::SeqCst);
            self.request_sync();
        }
        came_online
    }

    /// Ask the background loop for a sync pass.
    pub fn request_sync(&self) {
        self.shared.sync_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Wake the background loop so it re-reads its deadlines.
    pub(crate) fn wake(&self) {
        self.shared.wake.notify_one();
    }

    // ---- mutations ----

    /// Apply `mutation` optimistically, enqueue it and wait for the queue to
    /// reach disk. A failed save leaves the mutation queued in memory.
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationId> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let now = self.now();
        let id = self.store().mutate(mutation, now)?;
        tracing::debug!(mutation_id = %id, "Mutation queued");
        self.persist().await;
        self.request_sync();
        Ok(id)
    }

    /// Send a terminally failed mutation again.
    pub async fn retry(&self, id: MutationId) -> Result<()> {
        let now = self.now();
        self.store().retry(id, now)?;
        tracing::info!(mutation_id = %id, "Mutation re-queued");
        self.persist().await;
        self.request_sync();
        Ok(())
    }

    /// Drop a mutation and undo its optimistic effect.
    pub async fn discard(&self, id: MutationId) -> Result<MutationRecord> {
        let now = self.now();
        let record = self.store().discard(id, now)?;
        tracing::info!(mutation_id = %id, "Mutation discarded");
        self.persist().await;
        Ok(record)
    }

    /// Deliver everything that is due, wave after wave, until nothing more
    /// can go out. Returns how many deliveries were attempted.
    pub async fn sync_now(&self) -> Result<usize> {
        let _pass = self.shared.sync_lock.lock().await;
        let mut delivered = 0;
        let mut refetch = BTreeSet::new();

        while !self.is_closed() {
            let now = self.now();
            let batch = self.store().next_batch(now)?;
            if batch.is_empty() {
                break;
            }
            tracing::debug!(count = batch.len(), "Dispatching mutations");

            let mut deliveries: FuturesUnordered<_> =
                batch.into_iter().map(|record| self.deliver(record)).collect();
            while let Some((record, result)) = deliveries.next().await {
                delivered += 1;
                refetch.extend(self.settle(&record, result));
                self.persist().await;
            }
        }

        self.schedule_retry();
        if !refetch.is_empty() {
            join_all(refetch.iter().map(|key| self.fetch(key))).await;
        }
        Ok(delivered)
    }

    async fn deliver(
        &self,
        record: MutationRecord,
    ) -> (MutationRecord, std::result::Result<MutationAck, GatewayError>) {
        tracing::debug!(
            mutation_id = %record.id,
            kind = ?record.mutation.kind(),
            attempt = record.attempt_count,
            "Sending mutation"
        );
        let result = self.bounded(self.shared.gateway.mutate(&record)).await;
        (record, result)
    }

    /// Feed a gateway answer to the engine. Returns list keys to refetch.
    fn settle(
        &self,
        record: &MutationRecord,
        result: std::result::Result<MutationAck, GatewayError>,
    ) -> Vec<QueryKey> {
        let now = self.now();
        let outcome = {
            let mut store = self.shared.store.lock();
            let mut rng = self.shared.rng.lock();
            store.complete(record.id, result, now, &mut *rng)
        };
        let id = record.id;
        match outcome {
            Ok(SyncOutcome::Committed { refetch }) => {
                tracing::debug!(mutation_id = %id, "Mutation committed");
                refetch
            }
            Ok(SyncOutcome::RetryScheduled { at, attempt }) => {
                tracing::warn!(
                    mutation_id = %id,
                    attempt,
                    retry_at = at,
                    "Delivery failed; retry scheduled"
                );
                Vec::new()
            }
            Ok(SyncOutcome::Resubmitted { overwritten }) => {
                tracing::info!(
                    mutation_id = %id,
                    overwritten = ?overwritten,
                    "Conflict merged; resubmitting"
                );
                Vec::new()
            }
            Ok(SyncOutcome::Failed { notice }) => {
                tracing::warn!(mutation_id = %id, "Mutation failed: {}", notice.message());
                Vec::new()
            }
            Ok(SyncOutcome::Discarded { notice }) => {
                match notice {
                    Some(notice) => {
                        tracing::info!(mutation_id = %id, "Mutation dropped: {}", notice.message())
                    }
                    None => tracing::info!(mutation_id = %id, "Mutation dropped"),
                }
                Vec::new()
            }
            Err(e) => {
                tracing::error!(mutation_id = %id, "Could not settle mutation: {}", e);
                Vec::new()
            }
        }
    }

    /// Keep one retry wake-up at the queue's earliest backoff deadline.
    fn schedule_retry(&self) {
        let (online, next) = {
            let store = self.store();
            (store.sync_state().is_online, store.next_retry_at())
        };
        {
            let mut scheduler = self.shared.scheduler.lock();
            scheduler.cancel_where(|task| *task == Task::Retry);
            match next {
                Some(at) if online => scheduler.schedule(at, Task::Retry),
                _ => return,
            }
        }
        self.shared.wake.notify_one();
    }

    // ---- queries ----

    /// Fetch `key` from the gateway. Returns `false` if a fetch was already
    /// running or the result was discarded.
    pub async fn fetch(&self, key: &QueryKey) -> bool {
        let now = self.now();
        let Some(ticket) = self.store().begin_fetch(key, now) else {
            return false;
        };
        tracing::debug!(key = %key, "Fetching query");
        let result = self.bounded(self.shared.gateway.query(key)).await;
        if let Err(e) = &result {
            tracing::warn!(key = %key, error = %e, "Fetch failed");
        }
        let now = self.now();
        let applied = self.store().finish_fetch(&ticket, result, now);
        if applied {
            self.schedule_cache_save();
        } else {
            tracing::debug!(key = %key, "Fetch result discarded");
        }
        applied
    }

    /// Refetch every watched query past its stale time.
    pub async fn refresh_stale(&self) -> usize {
        if !self.is_online() {
            return 0;
        }
        let now = self.now();
        self.shared.swept_at.store(now, Ordering::SeqCst);
        let keys = self.store().due_for_refetch(now);
        join_all(keys.iter().map(|key| self.fetch(key))).await;
        keys.len()
    }

    /// Apply a real-time change from the gateway.
    pub fn receive_push(&self, key: QueryKey, value: Value) -> PushOutcome {
        let now = self.now();
        let outcome = self.store().receive_push(&key, value, now);
        match outcome {
            PushOutcome::Applied => {
                tracing::debug!(key = %key, "Push applied");
                self.schedule_cache_save();
            }
            PushOutcome::Buffered => {
                tracing::debug!(key = %key, "Push held until the in-flight mutation settles");
            }
            PushOutcome::Ignored => tracing::trace!(key = %key, "Push for uncached key ignored"),
        }
        outcome
    }

    /// Pushes held back by in-flight mutations.
    pub fn buffered_pushes(&self) -> usize {
        self.store().buffered_count()
    }

    /// A gateway push handler that feeds this coordinator for as long as it
    /// lives.
    pub fn push_handler(&self) -> PushHandler {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |key: QueryKey, value: Value| {
            if let Some(shared) = shared.upgrade() {
                SyncCoordinator { shared }.receive_push(key, value);
            }
        })
    }

    /// Run one gateway call once a slot is free, under the request timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, GatewayError>>,
    ) -> std::result::Result<T, GatewayError> {
        let _slot = self
            .shared
            .gateway_slots
            .acquire()
            .await
            .map_err(|_| GatewayError::transient("gateway slots closed"))?;
        match tokio::time::timeout(self.shared.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout()),
        }
    }

    // ---- persistence ----

    /// Save the whole document and wait for the writer.
    async fn persist(&self) {
        let state = self.store().export_state();
        if let Err(e) = self.shared.writer.save(state).await {
            tracing::debug!(error = %e, "Keeping state in memory");
        }
    }

    /// Save and report failure to the caller.
    pub async fn flush(&self) -> Result<()> {
        let state = self.store().export_state();
        self.shared.writer.save(state).await?;
        Ok(())
    }

    /// Push the cache save back by one debounce window, but never further
    /// than a few windows past the first unsaved change.
    fn schedule_cache_save(&self) {
        let now = self.now();
        let window = millis(self.shared.config.save_debounce);
        let since = *self.shared.dirty_since.lock().get_or_insert(now);
        let latest = since.saturating_add(window.saturating_mul(MAX_SAVE_DELAY_WINDOWS));
        let at = now.saturating_add(window).min(latest);
        {
            let mut scheduler = self.shared.scheduler.lock();
            scheduler.cancel_where(|task| *task == Task::SaveCache);
            scheduler.schedule(at, Task::SaveCache);
        }
        self.shared.wake.notify_one();
    }

    /// Keep one refresh wake-up at the next time a watched query turns
    /// stale. Entries already stale at the last sweep wait for the tick.
    fn schedule_refresh(&self) {
        let swept_at = self.shared.swept_at.load(Ordering::SeqCst);
        let next = {
            let store = self.store();
            if store.sync_state().is_online {
                store.cache().next_stale_at(swept_at)
            } else {
                None
            }
        };
        let mut scheduler = self.shared.scheduler.lock();
        scheduler.cancel_where(|task| *task == Task::Refresh);
        if let Some(at) = next {
            scheduler.schedule(at, Task::Refresh);
        }
    }

    fn schedule_tick(&self) {
        let at = self.now() + millis(self.shared.config.tick_interval);
        let mut scheduler = self.shared.scheduler.lock();
        scheduler.cancel_where(|task| *task == Task::Tick);
        scheduler.schedule(at, Task::Tick);
    }

    // ---- background loop ----

    /// Run until `shutdown` flips to `true` or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connectivity = self.shared.network.subscribe();
        let online = *connectivity.borrow_and_update();
        self.apply_connectivity(online);
        self.schedule_tick();
        tracing::info!(online, "Sync coordinator started");

        loop {
            self.schedule_refresh();
            let idle = self.until_next_deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    self.apply_connectivity(online);
                }
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            if self.is_closed() {
                break;
            }
            self.run_due().await;
        }
        tracing::info!("Sync coordinator stopped");
    }

    fn until_next_deadline(&self) -> Duration {
        match self.shared.scheduler.lock().next_deadline() {
            Some(at) => Duration::from_millis(at.saturating_sub(self.now())),
            None => self.shared.config.tick_interval,
        }
    }

    async fn run_due(&self) {
        if self.shared.sync_requested.swap(false, Ordering::SeqCst) && self.is_online() {
            self.sync_logged().await;
        }
        if self.shared.refresh_requested.swap(false, Ordering::SeqCst) {
            self.refresh_stale().await;
        }

        let now = self.now();
        let due = self.shared.scheduler.lock().pop_due(now);
        for task in due {
            match task {
                Task::Retry => self.sync_logged().await,
                Task::Tick => self.tick().await,
                Task::SaveCache => {
                    *self.shared.dirty_since.lock() = None;
                    let state = self.store().export_state();
                    self.shared.writer.save_detached(state);
                }
                Task::Refresh => {
                    self.refresh_stale().await;
                }
            }
        }
    }

    async fn sync_logged(&self) {
        match self.sync_now().await {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "Sync pass finished"),
            Err(e) => tracing::error!("Sync pass failed: {}", e),
        }
    }

    async fn tick(&self) {
        self.schedule_tick();
        if self.is_online() {
            self.sync_logged().await;
            self.refresh_stale().await;
        }
        let now = self.now();
        let collected = self.store().collect_garbage(now);
        if !collected.is_empty() {
            tracing::debug!(count = collected.len(), "Collected unwatched queries");
            self.schedule_cache_save();
        }
        if self.durability_degraded() {
            self.persist().await;
        }
    }

    /// Stop accepting work. The background loop exits on its next wake-up.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Flush and stop the persist writer.
    pub(crate) async fn close_writer(&self) {
        self.shared.writer.close().await;
    }
}
