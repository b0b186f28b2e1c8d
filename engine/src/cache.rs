//! Query Cache: an in-memory map from query key to cache entry.
//!
//! The cache follows stale-while-revalidate. Data is only ever replaced as a
//! whole value; invalidation marks an entry stale without touching its data.
//! Entries are reference counted by subscribers and collected after a grace
//! period once nobody watches them.

use crate::clock::millis;
use crate::{QueryDescriptor, QueryKey, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cache-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// How long fetched data counts as fresh
    pub stale_time: Duration,
    /// Grace period before an unwatched entry is collected
    pub gc_time: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
    #[default]
    Idle,
    /// First fetch running, no data yet
    Fetching,
    Success,
    /// First fetch failed, no data
    Error,
}

/// One cache slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: QueryKey,
    /// What readers see: the confirmed value with pending mutations applied
    pub data: Option<Value>,
    /// Last authoritative server value
    pub confirmed: Option<Value>,
    pub confirmed_at: Option<Timestamp>,
    pub status: QueryStatus,
    pub last_updated_at: Option<Timestamp>,
    /// `None` once invalidated or before the first fetch
    pub stale_after: Option<Timestamp>,
    /// Per-query stale time override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_time: Option<u64>,
    #[serde(skip)]
    pub subscriber_count: u32,
    pub error: Option<String>,
    pub optimistic: bool,
    #[serde(skip)]
    fetching: bool,
    #[serde(skip)]
    fetch_generation: u64,
    #[serde(skip)]
    released_at: Option<Timestamp>,
}

impl CacheEntry {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            confirmed: None,
            confirmed_at: None,
            status: QueryStatus::Idle,
            last_updated_at: None,
            stale_after: None,
            stale_time: None,
            subscriber_count: 0,
            error: None,
            optimistic: false,
            fetching: false,
            fetch_generation: 0,
            released_at: None,
        }
    }

    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.stale_after.map_or(true, |at| now >= at)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching
    }

    /// Whether a server value has ever been recorded for this key.
    pub fn has_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    /// The UI projection of this entry.
    pub fn view(&self, now: Timestamp) -> QueryView {
        QueryView {
            data: self.data.clone(),
            status: self.status,
            is_stale: self.is_stale(now),
            is_fetching: self.fetching,
            error: self.error.clone(),
        }
    }

    fn settled(&self) -> CacheEntry {
        let mut entry = self.clone();
        entry.fetching = false;
        if entry.status == QueryStatus::Fetching {
            entry.status = QueryStatus::Idle;
        }
        entry
    }
}

/// What a query hook returns.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryView {
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub error: Option<String>,
}

/// Identifies a fetch so a late result can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: QueryKey,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Called with the entry after every change to a watched key.
pub type Observer = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// The in-memory query cache.
#[derive(Default)]
pub struct QueryCache {
    config: CacheConfig,
    entries: HashMap<QueryKey, CacheEntry>,
    observers: HashMap<QueryKey, Vec<(SubscriptionId, Observer)>>,
    subscriptions: HashMap<SubscriptionId, QueryKey>,
    next_subscription: u64,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Current data of `key`, if any.
    pub fn data(&self, key: &QueryKey) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.data.as_ref())
    }

    pub fn view(&self, key: &QueryKey, now: Timestamp) -> QueryView {
        self.entries
            .get(key)
            .map(|e| e.view(now))
            .unwrap_or_else(|| CacheEntry::new(key.clone()).view(now))
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically replace the data and status of `key`.
    ///
    /// The write is authoritative and becomes the confirmed value. A
    /// `Success` write also clears the error and restarts the staleness clock.
    pub fn set(
        &mut self,
        key: &QueryKey,
        data: Option<Value>,
        status: QueryStatus,
        now: Timestamp,
    ) {
        let stale_time = self.config.stale_time;
        let entry = self.slot(key, now);
        entry.confirmed = data.clone();
        if status == QueryStatus::Success {
            entry.confirmed_at = Some(now);
            let fresh_for = entry.stale_time.unwrap_or_else(|| millis(stale_time));
            entry.stale_after = Some(now.saturating_add(fresh_for));
            entry.error = None;
        }
        entry.data = data;
        entry.status = status;
        entry.optimistic = false;
        entry.last_updated_at = Some(now);
        self.notify(key);
    }

    /// Record an authoritative value without touching the visible data.
    ///
    /// Used when pending mutations still apply on top of it.
    pub fn confirm(&mut self, key: &QueryKey, confirmed: Option<Value>, now: Timestamp) {
        let stale_time = self.config.stale_time;
        let entry = self.slot(key, now);
        entry.confirmed = confirmed;
        entry.confirmed_at = Some(now);
        let fresh_for = entry.stale_time.unwrap_or_else(|| millis(stale_time));
        entry.stale_after = Some(now.saturating_add(fresh_for));
        entry.error = None;
    }

    /// Replace the visible data of `key`, flagging whether it is provisional.
    pub fn write(&mut self, key: &QueryKey, data: Option<Value>, optimistic: bool, now: Timestamp) {
        let entry = self.slot(key, now);
        entry.status = if data.is_some() || entry.has_confirmed() {
            QueryStatus::Success
        } else if entry.fetching {
            QueryStatus::Fetching
        } else if entry.error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Idle
        };
        entry.data = data;
        entry.optimistic = optimistic;
        entry.last_updated_at = Some(now);
        self.notify(key);
    }

    /// Start a fetch of `key`, unless one is already running.
    pub fn begin_fetch(&mut self, key: &QueryKey, now: Timestamp) -> Option<FetchTicket> {
        let entry = self.slot(key, now);
        if entry.fetching {
            return None;
        }
        entry.fetching = true;
        entry.fetch_generation += 1;
        if entry.data.is_none() {
            entry.status = QueryStatus::Fetching;
        }
        let ticket = FetchTicket {
            key: key.clone(),
            generation: entry.fetch_generation,
        };
        self.notify(key);
        Some(ticket)
    }

    /// Close a fetch; returns `false` when its result must be discarded.
    pub fn end_fetch(&mut self, ticket: &FetchTicket) -> bool {
        match self.entries.get_mut(&ticket.key) {
            Some(entry) if entry.fetching && entry.fetch_generation == ticket.generation => {
                entry.fetching = false;
                true
            }
            _ => false,
        }
    }

    /// Record a failed fetch. Prior data stays visible.
    pub fn fail_fetch(
        &mut self,
        ticket: &FetchTicket,
        error: impl Into<String>,
        now: Timestamp,
    ) -> bool {
        if !self.end_fetch(ticket) {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(&ticket.key) {
            entry.error = Some(error.into());
            entry.status = if entry.data.is_some() {
                QueryStatus::Success
            } else {
                QueryStatus::Error
            };
            entry.last_updated_at = Some(now);
        }
        self.notify(&ticket.key);
        true
    }

    /// Mark `key` stale. Returns `true` when a subscriber wants it refetched.
    pub fn invalidate(&mut self, key: &QueryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stale_after = None;
                let watched = entry.subscriber_count > 0;
                self.notify(key);
                watched
            }
            None => false,
        }
    }

    /// Invalidate every key starting with `prefix`; returns the watched ones.
    pub fn invalidate_prefix(&mut self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.invalidate_where(|key| key.starts_with(prefix))
    }

    /// Invalidate every key matching `pred`; returns the watched ones.
    pub fn invalidate_where(&mut self, pred: impl Fn(&QueryKey) -> bool) -> Vec<QueryKey> {
        let mut matched: Vec<QueryKey> = self.entries.keys().filter(|k| pred(k)).cloned().collect();
        matched.sort();
        matched
            .into_iter()
            .filter(|key| self.invalidate(key))
            .collect()
    }

    /// Watch `descriptor`; the observer runs after every change to its entry.
    pub fn subscribe(
        &mut self,
        descriptor: &QueryDescriptor,
        observer: Observer,
        now: Timestamp,
    ) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        let entry = self.slot(&descriptor.key, now);
        entry.subscriber_count += 1;
        entry.released_at = None;
        if let Some(stale_time) = descriptor.stale_time {
            entry.stale_time = Some(millis(stale_time));
        }
        self.subscriptions.insert(id, descriptor.key.clone());
        self.observers
            .entry(descriptor.key.clone())
            .or_default()
            .push((id, observer));
        id
    }

    /// Drop a subscription. When the last one goes, a running fetch is
    /// cancelled and the grace period starts.
    pub fn unsubscribe(&mut self, id: SubscriptionId, now: Timestamp) -> bool {
        let Some(key) = self.subscriptions.remove(&id) else {
            return false;
        };
        if let Some(list) = self.observers.get_mut(&key) {
            list.retain(|(sub, _)| *sub != id);
            if list.is_empty() {
                self.observers.remove(&key);
            }
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
            if entry.subscriber_count == 0 {
                entry.released_at = Some(now);
                if entry.fetching {
                    entry.fetching = false;
                    entry.fetch_generation += 1;
                    if entry.status == QueryStatus::Fetching {
                        entry.status = QueryStatus::Idle;
                    }
                }
            }
        }
        true
    }

    /// Drop `key`'s data. Watched slots stay, empty; others go away.
    pub fn remove(&mut self, key: &QueryKey, now: Timestamp) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.subscriber_count == 0 {
            self.entries.remove(key);
            return true;
        }
        entry.data = None;
        entry.confirmed = None;
        entry.confirmed_at = Some(now);
        entry.optimistic = false;
        entry.error = None;
        entry.status = QueryStatus::Success;
        entry.last_updated_at = Some(now);
        self.notify(key);
        true
    }

    /// Remove unwatched entries whose grace period has passed.
    ///
    /// Keys for which `pinned` returns `true` are kept regardless.
    pub fn collect_garbage(
        &mut self,
        now: Timestamp,
        pinned: impl Fn(&QueryKey) -> bool,
    ) -> Vec<QueryKey> {
        let grace = millis(self.config.gc_time);
        let mut expired: Vec<QueryKey> = self
            .entries
            .values()
            .filter(|e| e.subscriber_count == 0 && !e.fetching)
            .filter(|e| e.released_at.is_some_and(|at| now.saturating_sub(at) >= grace))
            .map(|e| e.key.clone())
            .filter(|k| !pinned(k))
            .collect();
        expired.sort();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Watched, stale keys with no fetch running.
    pub fn due_for_refetch(&self, now: Timestamp) -> Vec<QueryKey> {
        let mut due: Vec<QueryKey> = self
            .entries
            .values()
            .filter(|e| e.subscriber_count > 0 && !e.fetching && e.is_stale(now))
            .map(|e| e.key.clone())
            .collect();
        due.sort();
        due
    }

    /// Earliest time after `after` at which a watched entry turns stale.
    pub fn next_stale_at(&self, after: Timestamp) -> Option<Timestamp> {
        self.entries
            .values()
            .filter(|e| e.subscriber_count > 0)
            .filter_map(|e| e.stale_after)
            .filter(|&at| at > after)
            .min()
    }

    /// Every entry, as last settled, in key order.
    pub fn snapshot(&self) -> BTreeMap<QueryKey, CacheEntry> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.settled()))
            .collect()
    }

    /// Load persisted entries. Subscribers and running fetches are kept.
    pub fn restore(&mut self, entries: BTreeMap<QueryKey, CacheEntry>, now: Timestamp) {
        for (key, mut entry) in entries {
            entry.key = key.clone();
            match self.entries.get(&key) {
                Some(existing) => {
                    entry.subscriber_count = existing.subscriber_count;
                    entry.fetching = existing.fetching;
                    entry.fetch_generation = existing.fetch_generation;
                    entry.released_at = existing.released_at;
                }
                None => {
                    entry.subscriber_count = 0;
                    entry.released_at = Some(now);
                }
            }
            self.entries.insert(key.clone(), entry);
            self.notify(&key);
        }
    }

    fn slot(&mut self, key: &QueryKey, now: Timestamp) -> &mut CacheEntry {
        self.entries.entry(key.clone()).or_insert_with(|| {
            let mut entry = CacheEntry::new(key.clone());
            entry.released_at = Some(now);
            entry
        })
    }

    fn notify(&self, key: &QueryKey) {
        let (Some(entry), Some(observers)) = (self.entries.get(key), self.observers.get(key)) else {
            return;
        };
        for (_, observer) in observers {
            observer(entry);
        }
    }
}
