//! Optimistic Update Applier.
//!
//! Every cache entry obeys one rule: its visible data equals its confirmed
//! server value with every active mutation that targets it folded on top, in
//! queue order. Applying, committing and rolling back are all expressed as
//! "change the inputs, then rebase the affected keys", so rolling back one
//! mutation never erases a later one.

use crate::key::KeyShape;
use crate::reducer::{absorb, fold, reduce, Patch};
use crate::{
    error::Result, Error, Mutation, MutationAck, MutationId, MutationQueue, MutationRecord,
    QueryCache, QueryKey, Timestamp,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Optimistically apply `mutation` and enqueue it.
///
/// The data of every target key right before the write is captured as the
/// record's previous snapshot. With an earlier mutation still pending on a
/// key, that is the earlier mutation's optimistic value.
pub fn apply(
    cache: &mut QueryCache,
    queue: &mut MutationQueue,
    mutation: Mutation,
    now: Timestamp,
) -> MutationId {
    let targets = mutation.target_keys();
    let previous_snapshot: BTreeMap<QueryKey, Option<Value>> = targets
        .iter()
        .map(|key| (key.clone(), cache.data(key).cloned()))
        .collect();

    for key in &targets {
        let current = cache.data(key).cloned();
        match reduce(&mutation, key, current.as_ref()) {
            Patch::Keep => {}
            patch => {
                let next = patch.apply(current.as_ref());
                if next != current || cache.get(key).is_some() {
                    cache.write(key, next, true, now);
                }
            }
        }
    }
    queue.enqueue(mutation, previous_snapshot, now)
}

/// Recompute the visible data of `keys` from their confirmed values.
pub fn rebase(cache: &mut QueryCache, queue: &MutationQueue, keys: &[QueryKey], now: Timestamp) {
    for key in keys {
        let Some(entry) = cache.get(key) else {
            continue;
        };
        let active = queue.active_for_key(key);
        let data = fold(active.iter().map(|r| &r.mutation), key, entry.confirmed.as_ref());
        let optimistic = !active.is_empty();
        if data == entry.data && optimistic == entry.optimistic {
            continue;
        }
        cache.write(key, data, optimistic, now);
    }
}

/// Record a server value for `key` and re-apply pending mutations on top.
pub fn server_update(
    cache: &mut QueryCache,
    queue: &MutationQueue,
    key: &QueryKey,
    value: Option<Value>,
    now: Timestamp,
) {
    cache.confirm(key, value, now);
    let active = queue.active_for_key(key);
    let confirmed = cache.get(key).and_then(|e| e.confirmed.clone());
    let data = fold(active.iter().map(|r| &r.mutation), key, confirmed.as_ref());
    cache.write(key, data, !active.is_empty(), now);
}

/// Fold the server's result of a committed mutation into the cache and drop
/// the mutation from the queue.
///
/// Detail entries take the server record verbatim; once no other mutation is
/// pending on them, that is exactly what readers see.
pub fn commit(
    cache: &mut QueryCache,
    queue: &mut MutationQueue,
    id: MutationId,
    ack: &MutationAck,
    now: Timestamp,
) -> Result<MutationRecord> {
    queue.mark_committed(id)?;
    let record = queue.dequeue(id)?;
    for key in &record.target_keys {
        let is_detail = matches!(key.shape(), KeyShape::Detail(..));
        let Some(entry) = cache.get(key) else {
            if is_detail {
                cache.confirm(key, absorb(&record.mutation, key, None, &ack.server_result), now);
            }
            continue;
        };
        if !is_detail && !entry.has_confirmed() {
            continue;
        }
        let confirmed = absorb(
            &record.mutation,
            key,
            entry.confirmed.as_ref(),
            &ack.server_result,
        );
        cache.confirm(key, confirmed, now);
    }
    rebase(cache, queue, &record.target_keys, now);
    Ok(record)
}

/// Undo the optimistic effect of a mutation that is no longer active.
///
/// The record must already be out of the active set (failed terminally or
/// removed from the queue).
pub fn rollback(
    cache: &mut QueryCache,
    queue: &MutationQueue,
    record: &MutationRecord,
    now: Timestamp,
) -> Result<()> {
    if record.status.is_active() && queue.get(record.id).is_some() {
        return Err(Error::IllegalTransition {
            id: record.id,
            from: record.status.to_string(),
            to: "rolledBack".into(),
        });
    }
    rebase(cache, queue, &record.target_keys, now);
    Ok(())
}
