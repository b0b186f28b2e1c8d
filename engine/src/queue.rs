//! Mutation Queue: the ordered list of writes the server has not confirmed.
//!
//! The queue owns the lifecycle of every [`MutationRecord`]. Records are kept
//! in enqueue order; delivery is FIFO per record and concurrent across
//! records up to a limit.

use crate::backoff::BackoffPolicy;
use crate::{
    error::Result, Error, FailureKind, Mutation, MutationId, MutationRecord, MutationStatus,
    QueryKey, Timestamp,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum mutations in flight at once
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What happened to a mutation after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, due at the given time
    Scheduled { at: Timestamp, attempt: u32 },
    /// Attempts used up; the record is now `Failed(Terminal)`
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct MutationQueue {
    config: QueueConfig,
    records: Vec<MutationRecord>,
    last_created_at: Timestamp,
}

impl MutationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            last_created_at: 0,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a mutation and return its idempotency key.
    pub fn enqueue(
        &mut self,
        mutation: Mutation,
        previous_snapshot: BTreeMap<QueryKey, Option<Value>>,
        now: Timestamp,
    ) -> MutationId {
        let id = Uuid::new_v4();
        let created_at = self.next_created_at(now);
        self.records
            .push(MutationRecord::new(id, mutation, previous_snapshot, created_at));
        id
    }

    /// Remove a committed mutation.
    pub fn dequeue(&mut self, id: MutationId) -> Result<MutationRecord> {
        let record = self.get(id).ok_or(Error::MutationNotFound(id))?;
        if record.status != MutationStatus::Committed {
            return Err(Error::NotCommitted(id));
        }
        self.remove(id).ok_or(Error::MutationNotFound(id))
    }

    /// Mutations that may be dispatched at `now`.
    ///
    /// Each record lane yields at most its oldest active mutation, and only
    /// when nothing else is in flight on that lane. At most `concurrency`
    /// mutations are in flight in total.
    pub fn peek_next(&self, now: Timestamp) -> Vec<MutationId> {
        let limit = self.config.concurrency.saturating_sub(self.in_flight_count());
        let mut blocked = HashSet::new();
        let mut ready = Vec::new();
        for record in &self.records {
            if ready.len() >= limit {
                break;
            }
            if !record.status.is_active() {
                continue;
            }
            let lane = record.mutation.record_key();
            if !blocked.insert(lane) {
                continue;
            }
            if record.is_due(now) {
                ready.push(record.id);
            }
        }
        ready
    }

    pub fn mark_in_flight(&mut self, id: MutationId) -> Result<()> {
        let record = self.get_mut(id)?;
        record.transition(MutationStatus::InFlight)?;
        record.attempt_count += 1;
        record.next_attempt_at = None;
        Ok(())
    }

    pub fn mark_committed(&mut self, id: MutationId) -> Result<()> {
        let record = self.get_mut(id)?;
        record.transition(MutationStatus::Committed)?;
        record.last_error = None;
        Ok(())
    }

    /// Handle a network failure or timeout of an in-flight mutation.
    pub fn record_transient_failure(
        &mut self,
        id: MutationId,
        error: impl Into<String>,
        now: Timestamp,
        rng: &mut impl Rng,
    ) -> Result<RetryDecision> {
        let policy = self.config.backoff.clone();
        let record = self.get_mut(id)?;
        record.transition(MutationStatus::Failed(FailureKind::Retryable))?;
        record.last_error = Some(error.into());
        if !policy.allows_retry(record.attempt_count) {
            record.transition(MutationStatus::Failed(FailureKind::Terminal))?;
            return Ok(RetryDecision::Exhausted);
        }
        let at = now.saturating_add(policy.delay_millis(record.attempt_count, rng));
        record.transition(MutationStatus::Pending)?;
        record.next_attempt_at = Some(at);
        Ok(RetryDecision::Scheduled {
            at,
            attempt: record.attempt_count,
        })
    }

    /// Mark an in-flight mutation as a terminal failure.
    pub fn mark_failed(&mut self, id: MutationId, error: impl Into<String>) -> Result<()> {
        let record = self.get_mut(id)?;
        record.transition(MutationStatus::Failed(FailureKind::Terminal))?;
        record.last_error = Some(error.into());
        Ok(())
    }

    /// Move a mutation to `RolledBack` and drop it from the queue.
    pub fn mark_rolled_back(&mut self, id: MutationId) -> Result<MutationRecord> {
        self.get_mut(id)?.transition(MutationStatus::RolledBack)?;
        self.remove(id).ok_or(Error::MutationNotFound(id))
    }

    /// Send an in-flight mutation again, as a rewritten mutation.
    ///
    /// The record keeps its id, so the server can still deduplicate it.
    pub fn resubmit(&mut self, id: MutationId, mutation: Mutation) -> Result<()> {
        let record = self.get_mut(id)?;
        record.transition(MutationStatus::Pending)?;
        record.mutation = mutation;
        record.next_attempt_at = None;
        Ok(())
    }

    /// Re-queue a terminally failed mutation at the tail.
    pub fn retry(&mut self, id: MutationId, now: Timestamp) -> Result<()> {
        let created_at = self.next_created_at(now);
        let pos = self.position(id)?;
        let mut record = self.records.remove(pos);
        if let Err(err) = record.transition(MutationStatus::Pending) {
            self.records.insert(pos, record);
            return Err(err);
        }
        record.attempt_count = 0;
        record.next_attempt_at = None;
        record.last_error = None;
        record.created_at = created_at;
        self.records.push(record);
        Ok(())
    }

    /// Drop a mutation the user gave up on. In-flight mutations cannot be
    /// discarded.
    pub fn discard(&mut self, id: MutationId) -> Result<MutationRecord> {
        let record = self.get(id).ok_or(Error::MutationNotFound(id))?;
        if record.status == MutationStatus::InFlight {
            return Err(Error::InFlight(id));
        }
        self.mark_rolled_back(id)
    }

    pub fn remove(&mut self, id: MutationId) -> Option<MutationRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    pub fn get(&self, id: MutationId) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// All records, in queue order.
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    /// Active mutations patching `key`, in queue order.
    pub fn active_for_key(&self, key: &QueryKey) -> Vec<&MutationRecord> {
        self.records
            .iter()
            .filter(|r| r.status.is_active() && r.targets(key))
            .collect()
    }

    pub fn has_in_flight_for(&self, key: &QueryKey) -> bool {
        self.records
            .iter()
            .any(|r| r.status == MutationStatus::InFlight && r.targets(key))
    }

    pub fn in_flight_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == MutationStatus::InFlight)
            .count()
    }

    /// Mutations the server has yet to apply and that are still being tried.
    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_active()).count()
    }

    /// Mutations waiting on the user to retry or discard.
    pub fn failed(&self) -> impl Iterator<Item = &MutationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == MutationStatus::Failed(FailureKind::Terminal))
    }

    /// Earliest scheduled retry.
    pub fn next_attempt_at(&self) -> Option<Timestamp> {
        self.records
            .iter()
            .filter(|r| r.status == MutationStatus::Pending)
            .filter_map(|r| r.next_attempt_at)
            .min()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<MutationRecord> {
        self.records.clone()
    }

    /// Load persisted records. A mutation that was in flight when the
    /// process stopped may or may not have reached the server; it is sent
    /// again under the same id.
    pub fn restore(&mut self, mut records: Vec<MutationRecord>) {
        records.sort_by_key(|r| r.created_at);
        for mut record in records {
            if record.status == MutationStatus::InFlight {
                record.status = MutationStatus::Pending;
            }
            self.last_created_at = self.last_created_at.max(record.created_at);
            self.records.retain(|r| r.id != record.id);
            self.records.push(record);
        }
    }

    fn get_mut(&mut self, id: MutationId) -> Result<&mut MutationRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::MutationNotFound(id))
    }

    fn position(&self, id: MutationId) -> Result<usize> {
        self.records
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::MutationNotFound(id))
    }

    fn next_created_at(&mut self, now: Timestamp) -> Timestamp {
        let at = now.max(self.last_created_at + 1);
        self.last_created_at = at;
        at
    }
}
