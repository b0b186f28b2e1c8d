//! Store: the deterministic core of the data layer.
//!
//! The Store owns the query cache, the mutation queue, buffered real-time
//! pushes and user notices, and drives each mutation through its lifecycle.
//! It performs no IO; the async client feeds it gateway results and the
//! current time, and persists what it exports.

use crate::conflict::{resolve, Resolution};
use crate::key::{detail_key, KeyShape};
use crate::optimistic;
use crate::queue::RetryDecision;
use crate::reducer::{absorb, is_tombstone};
use crate::{
    error::Result, CacheConfig, Disposition, Error, FetchTicket, GatewayError, Mutation,
    MutationAck, MutationId, MutationQueue, MutationRecord, MutationStatus, Notice, NoticeKind,
    Observer, PersistedState, QueryCache, QueryDescriptor, QueryKey, QueryView, QueueConfig,
    Schema, SubscriptionId, Timestamp, SNAPSHOT_FORMAT_VERSION,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Process-wide sync status shown to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub pending_count: usize,
    pub last_sync_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreConfig {
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

/// What became of a mutation after the gateway answered.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Applied by the server. Watched list keys to refetch are included.
    Committed { refetch: Vec<QueryKey> },
    /// Transient failure; another attempt is due at `at`
    RetryScheduled { at: Timestamp, attempt: u32 },
    /// Conflict resolved; the rewritten mutation goes out again
    Resubmitted { overwritten: BTreeSet<String> },
    /// Terminal failure, kept in the queue for manual retry or discard
    Failed { notice: Notice },
    /// Rolled back and dropped from the queue
    Discarded { notice: Option<Notice> },
}

/// What became of a real-time push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    /// Held until the in-flight mutation on the key resolves
    Buffered,
    /// Nobody caches that key
    Ignored,
}

/// The main store holding all client-side state.
#[derive(Debug)]
pub struct Store {
    schema: Schema,
    cache: QueryCache,
    queue: MutationQueue,
    buffered: BTreeMap<QueryKey, Option<Value>>,
    notices: Vec<Notice>,
    sync_state: SyncState,
}

impl Default for Store {
    fn default() -> Self {
        Store::new(Schema::default(), StoreConfig::default())
    }
}

impl Store {
    pub fn new(schema: Schema, config: StoreConfig) -> Self {
        Self {
            schema,
            cache: QueryCache::new(config.cache),
            queue: MutationQueue::new(config.queue),
            buffered: BTreeMap::new(),
            notices: Vec::new(),
            sync_state: SyncState::default(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    // ---- queries ----

    pub fn view(&self, key: &QueryKey, now: Timestamp) -> QueryView {
        self.cache.view(key, now)
    }

    pub fn subscribe(
        &mut self,
        descriptor: &QueryDescriptor,
        observer: Observer,
        now: Timestamp,
    ) -> SubscriptionId {
        self.cache.subscribe(descriptor, observer, now)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId, now: Timestamp) -> bool {
        self.cache.unsubscribe(id, now)
    }

    /// Start fetching `key`; `None` when a fetch is already running.
    pub fn begin_fetch(&mut self, key: &QueryKey, now: Timestamp) -> Option<FetchTicket> {
        self.cache.begin_fetch(key, now)
    }

    /// Settle a fetch. Returns `false` if the result was discarded because
    /// every subscriber left while it ran.
    pub fn finish_fetch(
        &mut self,
        ticket: &FetchTicket,
        result: std::result::Result<Value, GatewayError>,
        now: Timestamp,
    ) -> bool {
        match result {
            Ok(value) => {
                if !self.cache.end_fetch(ticket) {
                    return false;
                }
                let value = normalize(&ticket.key, value);
                if self.queue.has_in_flight_for(&ticket.key) {
                    self.buffered.insert(ticket.key.clone(), value);
                } else {
                    optimistic::server_update(
                        &mut self.cache,
                        &self.queue,
                        &ticket.key,
                        value,
                        now,
                    );
                }
                true
            }
            Err(err) => self.cache.fail_fetch(ticket, err.to_string(), now),
        }
    }

    /// Mark `key` stale; `true` when it should be refetched now.
    pub fn invalidate(&mut self, key: &QueryKey) -> bool {
        self.cache.invalidate(key)
    }

    pub fn invalidate_prefix(&mut self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.cache.invalidate_prefix(prefix)
    }

    pub fn due_for_refetch(&self, now: Timestamp) -> Vec<QueryKey> {
        self.cache.due_for_refetch(now)
    }

    /// Collect unwatched entries, keeping any a queued mutation still targets.
    pub fn collect_garbage(&mut self, now: Timestamp) -> Vec<QueryKey> {
        let pinned: BTreeSet<QueryKey> = self
            .queue
            .records()
            .iter()
            .flat_map(|r| r.target_keys.iter().cloned())
            .collect();
        self.cache.collect_garbage(now, |key| pinned.contains(key))
    }

    // ---- real-time pushes ----

    /// Apply a server push for `key`, or hold it while a local mutation on
    /// that key is in flight.
    pub fn receive_push(&mut self, key: &QueryKey, value: Value, now: Timestamp) -> PushOutcome {
        if self.cache.get(key).is_none() {
            return PushOutcome::Ignored;
        }
        let value = normalize(key, value);
        if self.queue.has_in_flight_for(key) {
            self.buffered.insert(key.clone(), value);
            return PushOutcome::Buffered;
        }
        optimistic::server_update(&mut self.cache, &self.queue, key, value, now);
        PushOutcome::Applied
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    /// Apply held pushes whose keys have nothing in flight any more. A held
    /// record older than the confirmed one is dropped.
    fn flush_buffered(&mut self, keys: &[QueryKey], now: Timestamp) {
        for key in keys {
            if self.queue.has_in_flight_for(key) {
                continue;
            }
            let Some(value) = self.buffered.remove(key) else {
                continue;
            };
            let confirmed = self.cache.get(key).and_then(|e| e.confirmed.as_ref());
            if is_older(value.as_ref(), confirmed) {
                continue;
            }
            optimistic::server_update(&mut self.cache, &self.queue, key, value, now);
        }
    }

    // ---- mutations ----

    /// Validate, optimistically apply and enqueue a mutation.
    pub fn mutate(&mut self, mutation: Mutation, now: Timestamp) -> Result<MutationId> {
        self.validate(&mutation)?;
        let id = optimistic::apply(&mut self.cache, &mut self.queue, mutation, now);
        Ok(id)
    }

    fn validate(&self, mutation: &Mutation) -> Result<()> {
        let entity = self
            .schema
            .entity(mutation.entity())
            .ok_or_else(|| Error::UnknownEntity(mutation.entity().to_string()))?;
        let errors = match mutation {
            Mutation::Create { fields, .. } => entity.field_errors(fields),
            Mutation::AddNote { .. } => entity.field_errors(&mutation.field_values()),
            Mutation::Update { changes, .. } => entity.patch_errors(changes),
            Mutation::CancelAppointment { .. } => entity.patch_errors(&mutation.field_values()),
            Mutation::Delete { .. } | Mutation::ConfirmAppointment { .. } => Vec::new(),
        };
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidFields(errors))
        }
    }

    /// Mark the next dispatchable mutations in flight and return them.
    /// Nothing is dispatched while offline.
    pub fn next_batch(&mut self, now: Timestamp) -> Result<Vec<MutationRecord>> {
        if !self.sync_state.is_online {
            return Ok(Vec::new());
        }
        let mut batch = Vec::new();
        for id in self.queue.peek_next(now) {
            self.queue.mark_in_flight(id)?;
            if let Some(record) = self.queue.get(id) {
                batch.push(record.clone());
            }
        }
        Ok(batch)
    }

    /// Apply the gateway's answer for an in-flight mutation.
    pub fn complete(
        &mut self,
        id: MutationId,
        result: std::result::Result<MutationAck, GatewayError>,
        now: Timestamp,
        rng: &mut impl Rng,
    ) -> Result<SyncOutcome> {
        let record = self.queue.get(id).cloned().ok_or(Error::MutationNotFound(id))?;
        if record.status != MutationStatus::InFlight {
            return Err(Error::IllegalTransition {
                id,
                from: record.status.to_string(),
                to: "completed".into(),
            });
        }

        let outcome = match result {
            Ok(ack) => {
                optimistic::commit(&mut self.cache, &mut self.queue, id, &ack, now)?;
                self.sync_state.last_sync_at = Some(now);
                let refetch = record
                    .target_keys
                    .iter()
                    .filter(|k| {
                        matches!(k.shape(), KeyShape::List(_) | KeyShape::NotesForClient(_))
                    })
                    .filter(|k| self.cache.invalidate(k))
                    .cloned()
                    .collect();
                SyncOutcome::Committed { refetch }
            }
            Err(err) => match err.disposition() {
                Disposition::Retry => self.retry_later(&record, err, now, rng)?,
                Disposition::RollBack => {
                    self.queue.mark_failed(id, err.to_string())?;
                    self.roll_back_effect(&record, now)?;
                    let kind = match err {
                        GatewayError::Validation { field_errors } => {
                            NoticeKind::ValidationFailed { field_errors }
                        }
                        other => NoticeKind::PermissionDenied {
                            message: other.to_string(),
                        },
                    };
                    SyncOutcome::Failed {
                        notice: self.raise(&record, kind),
                    }
                }
                Disposition::Resolve => {
                    let current = match err {
                        GatewayError::Conflict { current } => current,
                        _ => None,
                    };
                    self.resolve_conflict(&record, current, now)?
                }
                Disposition::Remove => self.remove_record(&record, now)?,
            },
        };

        self.flush_buffered(&record.target_keys, now);
        Ok(outcome)
    }

    fn retry_later(
        &mut self,
        record: &MutationRecord,
        err: GatewayError,
        now: Timestamp,
        rng: &mut impl Rng,
    ) -> Result<SyncOutcome> {
        let message = match &err {
            GatewayError::Transient { message } => message.clone(),
            other => other.to_string(),
        };
        match self.queue.record_transient_failure(record.id, message.clone(), now, rng)? {
            RetryDecision::Scheduled { at, attempt } => {
                Ok(SyncOutcome::RetryScheduled { at, attempt })
            }
            RetryDecision::Exhausted => {
                self.roll_back_effect(record, now)?;
                let notice =
                    self.raise(record, NoticeKind::RetriesExhausted { last_error: message });
                Ok(SyncOutcome::Failed { notice })
            }
        }
    }

    fn resolve_conflict(
        &mut self,
        record: &MutationRecord,
        current: Option<Value>,
        now: Timestamp,
    ) -> Result<SyncOutcome> {
        let lane = record.mutation.record_key();
        if !self.queue.config().backoff.allows_retry(record.attempt_count) {
            self.queue.mark_failed(record.id, "conflict")?;
            self.roll_back_effect(record, now)?;
            let notice = self.raise(
                record,
                NoticeKind::RetriesExhausted {
                    last_error: "conflict".into(),
                },
            );
            return Ok(SyncOutcome::Failed { notice });
        }

        let assumed = record.previous_snapshot.get(&lane).cloned().flatten();
        match resolve(&record.mutation, assumed.as_ref(), current.as_ref()) {
            Resolution::Deleted => self.remove_record(record, now),
            Resolution::Resubmit(mutation) => {
                self.queue.resubmit(record.id, mutation)?;
                self.absorb_current(record, current, now);
                Ok(SyncOutcome::Resubmitted {
                    overwritten: BTreeSet::new(),
                })
            }
            Resolution::Merged {
                mutation,
                overwritten,
            } => {
                self.queue.resubmit(record.id, mutation)?;
                self.absorb_current(record, current, now);
                self.raise(
                    record,
                    NoticeKind::FieldsOverwritten {
                        fields: overwritten.clone(),
                    },
                );
                Ok(SyncOutcome::Resubmitted { overwritten })
            }
            Resolution::Superseded { overwritten } => {
                let removed = self.queue.mark_rolled_back(record.id)?;
                self.absorb_current(record, current, now);
                optimistic::rollback(&mut self.cache, &self.queue, &removed, now)?;
                let notice = (!overwritten.is_empty()).then(|| {
                    self.raise(
                        record,
                        NoticeKind::FieldsOverwritten {
                            fields: overwritten,
                        },
                    )
                });
                Ok(SyncOutcome::Discarded { notice })
            }
        }
    }

    /// Take the server's current record as the confirmed value of the
    /// mutation's keys.
    fn absorb_current(&mut self, record: &MutationRecord, current: Option<Value>, now: Timestamp) {
        let Some(current) = current else {
            return;
        };
        for key in &record.target_keys {
            let Some(entry) = self.cache.get(key) else {
                continue;
            };
            let confirmed = match key.shape() {
                KeyShape::Detail(..) => Some(current.clone()),
                _ if entry.has_confirmed() => {
                    absorb(&record.mutation, key, entry.confirmed.as_ref(), &current)
                }
                _ => continue,
            };
            optimistic::server_update(&mut self.cache, &self.queue, key, confirmed, now);
        }
    }

    /// The record is gone on the server: drop every mutation on it, remove
    /// its detail entry and take it out of lists.
    fn remove_record(&mut self, record: &MutationRecord, now: Timestamp) -> Result<SyncOutcome> {
        let lane = record.mutation.record_key();
        let doomed: Vec<MutationId> = self
            .queue
            .records()
            .iter()
            .filter(|r| r.mutation.record_key() == lane)
            .map(|r| r.id)
            .collect();

        let mut keys: BTreeSet<QueryKey> = BTreeSet::new();
        for id in doomed {
            let removed = match self.queue.get(id).map(|r| r.status) {
                Some(MutationStatus::RolledBack) | None => continue,
                Some(_) => self.queue.mark_rolled_back(id)?,
            };
            keys.extend(removed.target_keys.iter().cloned());
            self.notices.retain(|n| n.mutation_id != id);
        }

        let tombstone = serde_json::json!({ "id": record.mutation.record_id(), "deleted": true });
        for key in &keys {
            if key == &lane {
                continue;
            }
            let Some(entry) = self.cache.get(key) else {
                continue;
            };
            if entry.has_confirmed() {
                let confirmed = absorb(&record.mutation, key, entry.confirmed.as_ref(), &tombstone);
                self.cache.confirm(key, confirmed, now);
            }
        }
        self.buffered.remove(&lane);
        self.cache.remove(&lane, now);
        let rest: Vec<QueryKey> = keys.into_iter().filter(|k| k != &lane).collect();
        optimistic::rebase(&mut self.cache, &self.queue, &rest, now);

        let notice = self.raise(record, NoticeKind::RecordRemoved);
        Ok(SyncOutcome::Discarded {
            notice: Some(notice),
        })
    }

    fn roll_back_effect(&mut self, record: &MutationRecord, now: Timestamp) -> Result<()> {
        let current = self.queue.get(record.id).cloned().unwrap_or_else(|| record.clone());
        optimistic::rollback(&mut self.cache, &self.queue, &current, now)
    }

    fn raise(&mut self, record: &MutationRecord, kind: NoticeKind) -> Notice {
        let notice = Notice::new(
            record.id,
            record.mutation.entity(),
            record.mutation.record_id().clone(),
            kind,
        );
        self.notices.push(notice.clone());
        notice
    }

    /// Re-queue a terminally failed mutation at the tail and re-apply it.
    pub fn retry(&mut self, id: MutationId, now: Timestamp) -> Result<()> {
        self.queue.retry(id, now)?;
        self.notices.retain(|n| n.mutation_id != id);
        if let Some(record) = self.queue.get(id) {
            let keys = record.target_keys.clone();
            optimistic::rebase(&mut self.cache, &self.queue, &keys, now);
        }
        Ok(())
    }

    /// Drop a mutation the user gave up on and undo its effect.
    pub fn discard(&mut self, id: MutationId, now: Timestamp) -> Result<MutationRecord> {
        let record = self.queue.discard(id)?;
        self.notices.retain(|n| n.mutation_id != id);
        optimistic::rollback(&mut self.cache, &self.queue, &record, now)?;
        Ok(record)
    }

    // ---- notices and sync state ----

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn dismiss(&mut self, notice: Uuid) -> bool {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != notice);
        before != self.notices.len()
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            pending_count: self.queue.pending_count(),
            ..self.sync_state.clone()
        }
    }

    /// Record connectivity; returns `true` on an offline to online edge.
    pub fn set_online(&mut self, online: bool) -> bool {
        let came_online = online && !self.sync_state.is_online;
        self.sync_state.is_online = online;
        came_online
    }

    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.queue.next_attempt_at()
    }

    // ---- persistence ----

    pub fn export_state(&self) -> PersistedState {
        PersistedState {
            format_version: SNAPSHOT_FORMAT_VERSION,
            cache: self.cache.snapshot(),
            mutation_queue: self.queue.snapshot(),
            sync_state: self.sync_state(),
        }
    }

    /// Load a persisted document. Connectivity is not restored from disk.
    pub fn import_state(&mut self, state: PersistedState, now: Timestamp) -> Result<()> {
        state.validate()?;
        self.cache.restore(state.cache, now);
        self.queue.restore(state.mutation_queue);
        self.sync_state.last_sync_at = state.sync_state.last_sync_at;
        Ok(())
    }
}

/// Detail slots hold `None` for a deleted or missing record.
fn normalize(key: &QueryKey, value: Value) -> Option<Value> {
    match key.shape() {
        KeyShape::Detail(..) if is_tombstone(&value) => None,
        _ => Some(value),
    }
}

fn version_of(value: &Value) -> Option<u64> {
    value.get("version").and_then(Value::as_u64)
}

fn is_older(held: Option<&Value>, confirmed: Option<&Value>) -> bool {
    match (held.and_then(version_of), confirmed.and_then(version_of)) {
        (Some(held), Some(confirmed)) => held < confirmed,
        _ => false,
    }
}

/// Detail key of the record a notice is about.
pub fn notice_key(notice: &Notice) -> QueryKey {
    detail_key(notice.entity, &notice.record_id)
}
