//! The persisted document.
//!
//! One JSON document with the cache keyed by canonical query key, the
//! mutation queue ordered by creation time, and the sync state. Maps are
//! `BTreeMap`s so the same state always serializes to the same bytes.

use crate::{error::Result, CacheEntry, Error, MutationRecord, MutationStatus, QueryKey, SyncState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the persisted format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub format_version: u32,
    pub cache: BTreeMap<QueryKey, CacheEntry>,
    pub mutation_queue: Vec<MutationRecord>,
    #[serde(default)]
    pub sync_state: SyncState,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            cache: BTreeMap::new(),
            mutation_queue: Vec::new(),
            sync_state: SyncState::default(),
        }
    }
}

impl PersistedState {
    /// Check internal consistency: entry keys match their slots, mutation
    /// ids are unique and the queue is ordered by creation time.
    pub fn validate(&self) -> Result<()> {
        for (key, entry) in &self.cache {
            if &entry.key != key {
                return Err(Error::InvalidSnapshot(format!(
                    "cache entry {} stored under {key}",
                    entry.key
                )));
            }
        }
        let mut seen = HashSet::new();
        for record in &self.mutation_queue {
            if !seen.insert(record.id) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate mutation {}",
                    record.id
                )));
            }
        }
        if self
            .mutation_queue
            .windows(2)
            .any(|pair| pair[0].created_at > pair[1].created_at)
        {
            return Err(Error::InvalidSnapshot(
                "mutation queue is not ordered by creation time".into(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Parse a persisted document, rejecting formats newer than this build.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if state.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                state.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        state.validate()?;
        Ok(state)
    }
}

/// Summary of a persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub entry_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
}

impl From<&PersistedState> for SnapshotMetadata {
    fn from(state: &PersistedState) -> Self {
        let failed_count = state
            .mutation_queue
            .iter()
            .filter(|r| matches!(r.status, MutationStatus::Failed(_)))
            .count();
        Self {
            format_version: state.format_version,
            entry_count: state.cache.len(),
            pending_count: state.mutation_queue.len() - failed_count,
            failed_count,
        }
    }
}
