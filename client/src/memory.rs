//! In-process reference gateway.
//!
//! [`MemoryGateway`] behaves like a small document backend: versioned
//! records with tombstones, base-version conflict detection, idempotent
//! mutation application keyed by mutation id, schema validation and per-kind
//! permissions. Every change is fanned out to real-time subscribers whose
//! prefix matches the changed key. Tests and the simulation binary also use
//! it to play "another actor" and to inject faults.

use crate::gateway::{Gateway, PushHandler, Subscription};
use dashmap::DashMap;
use harbor_engine::reducer::is_tombstone;
use harbor_engine::{
    detail_key, key::KeyShape, list_key, notes_for_client_key, EntityKind, FieldError,
    GatewayError, Mutation, MutationAck, MutationId, MutationRecord, QueryKey, RecordId, Schema,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A scripted misbehaviour for the next mutation call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Answer with this error without applying anything
    Fail(GatewayError),
    /// Hold the call this long before applying it
    Delay(Duration),
    /// Apply the mutation, then answer with this error
    LoseAck(GatewayError),
}

#[derive(Debug, Default)]
struct Inner {
    /// Live records and tombstones
    records: BTreeMap<(EntityKind, RecordId), Value>,
    /// Server result of every applied mutation, by idempotency key
    applied: HashMap<MutationId, Value>,
    log: Vec<MutationId>,
    denied: HashSet<EntityKind>,
    faults: VecDeque<Fault>,
    latency: Duration,
    queries: usize,
}

type Subscribers = DashMap<u64, (QueryKey, PushHandler)>;

pub struct MemoryGateway {
    schema: Schema,
    inner: Mutex<Inner>,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    reachable: AtomicBool,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        MemoryGateway::new(Schema::default())
    }
}

impl MemoryGateway {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            inner: Mutex::new(Inner::default()),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a record as-is, at version 1 unless it carries one. No push.
    pub fn seed(&self, kind: EntityKind, mut record: Value) {
        let Some(id) = record.get("id").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        if record.get("version").is_none() {
            record["version"] = json!(1);
        }
        self.inner.lock().records.insert((kind, id), record);
    }

    /// The live record, if any.
    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.inner.lock().live(kind, id)
    }

    /// Another actor patches a record. Returns the new record.
    pub fn external_update(&self, kind: EntityKind, id: &str, changes: Value) -> Option<Value> {
        let pushes = {
            let mut inner = self.inner.lock();
            let mut record = inner.live(kind, id)?;
            if let (Some(target), Some(changes)) = (record.as_object_mut(), changes.as_object()) {
                target.extend(changes.clone());
            }
            bump_version(&mut record);
            inner.records.insert((kind, id.to_string()), record.clone());
            inner.changes(kind, id, &record)
        };
        let record = pushes.first().map(|(_, v)| v.clone());
        self.fan_out(pushes);
        record
    }

    /// Another actor deletes a record, leaving a tombstone.
    pub fn external_delete(&self, kind: EntityKind, id: &str) -> bool {
        let pushes = {
            let mut inner = self.inner.lock();
            let Some(mut record) = inner.live(kind, id) else {
                return false;
            };
            record["deleted"] = json!(true);
            bump_version(&mut record);
            inner.records.insert((kind, id.to_string()), record.clone());
            inner.changes(kind, id, &record)
        };
        self.fan_out(pushes);
        true
    }

    /// Refuse every mutation on `kind`.
    pub fn deny(&self, kind: EntityKind) {
        self.inner.lock().denied.insert(kind);
    }

    /// Queue a fault for an upcoming mutation call.
    pub fn push_fault(&self, fault: Fault) {
        self.inner.lock().faults.push_back(fault);
    }

    /// Delay added to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// While unreachable every call fails transiently.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Mutations applied, each counted once.
    pub fn applied_count(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Applied mutation ids in application order.
    pub fn log(&self) -> Vec<MutationId> {
        self.inner.lock().log.clone()
    }

    pub fn query_count(&self) -> usize {
        self.inner.lock().queries
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::transient("backend unreachable"))
        }
    }

    /// Deliver changes to every subscriber whose prefix matches.
    fn fan_out(&self, pushes: Vec<(QueryKey, Value)>) {
        let mut sent = 0;
        for (key, value) in pushes {
            let handlers: Vec<PushHandler> = self
                .subscribers
                .iter()
                .filter(|entry| key.starts_with(&entry.value().0))
                .map(|entry| entry.value().1.clone())
                .collect();
            for handler in handlers {
                handler(key.clone(), value.clone());
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::debug!(recipients = sent, "Pushed changes to subscribers");
        }
    }
}

#[async_trait::async_trait]
impl Gateway for MemoryGateway {
    async fn query(&self, key: &QueryKey) -> Result<Value, GatewayError> {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_reachable()?;

        let mut inner = self.inner.lock();
        inner.queries += 1;
        match key.shape() {
            KeyShape::Detail(kind, id) => Ok(inner.live(kind, &id).unwrap_or(Value::Null)),
            KeyShape::List(kind) => Ok(inner.list(kind)),
            KeyShape::NotesForClient(client_id) => Ok(inner.notes_for(&client_id)),
            KeyShape::Other => Err(GatewayError::NotFound),
        }
    }

    async fn mutate(&self, record: &MutationRecord) -> Result<MutationAck, GatewayError> {
        let (fault, latency) = {
            let mut inner = self.inner.lock();
            (inner.faults.pop_front(), inner.latency)
        };
        let delay = match &fault {
            Some(Fault::Delay(delay)) => *delay,
            _ => latency,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()?;
        if let Some(Fault::Fail(err)) = fault {
            return Err(err);
        }

        let (result, pushes) = self.inner.lock().apply(&self.schema, record);
        self.fan_out(pushes);
        match fault {
            Some(Fault::LoseAck(err)) => Err(err),
            _ => result,
        }
    }

    fn subscribe(&self, prefix: &QueryKey, handler: PushHandler) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, (prefix.clone(), handler));
        tracing::debug!(prefix = %prefix, "Real-time subscription registered");

        let subscribers = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            subscribers.remove(&id);
        })
    }
}

impl Inner {
    fn live(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.records
            .get(&(kind, id.to_string()))
            .filter(|r| !is_tombstone(r))
            .cloned()
    }

    fn list(&self, kind: EntityKind) -> Value {
        Value::Array(
            self.records
                .iter()
                .filter(|((k, _), r)| *k == kind && !is_tombstone(r))
                .map(|(_, r)| r.clone())
                .collect(),
        )
    }

    fn notes_for(&self, client_id: &str) -> Value {
        Value::Array(
            self.records
                .iter()
                .filter(|((k, _), r)| *k == EntityKind::Note && !is_tombstone(r))
                .filter(|(_, r)| r.get("clientId").and_then(Value::as_str) == Some(client_id))
                .map(|(_, r)| r.clone())
                .collect(),
        )
    }

    /// Every cached view a change to one record affects, with its new value.
    fn changes(&self, kind: EntityKind, id: &str, record: &Value) -> Vec<(QueryKey, Value)> {
        let mut pushes = vec![
            (detail_key(kind, id), record.clone()),
            (list_key(kind), self.list(kind)),
        ];
        if kind == EntityKind::Note {
            if let Some(client_id) = record.get("clientId").and_then(Value::as_str) {
                pushes.push((notes_for_client_key(client_id), self.notes_for(client_id)));
            }
        }
        pushes
    }

    fn apply(
        &mut self,
        schema: &Schema,
        record: &MutationRecord,
    ) -> (Result<MutationAck, GatewayError>, Vec<(QueryKey, Value)>) {
        if let Some(result) = self.applied.get(&record.id) {
            tracing::debug!(mutation_id = %record.id, "Duplicate delivery, answering from log");
            return (Ok(MutationAck::new(result.clone())), Vec::new());
        }
        match self.write(schema, &record.mutation) {
            Ok(value) => {
                self.applied.insert(record.id, value.clone());
                self.log.push(record.id);
                let mutation = &record.mutation;
                let pushes = self.changes(mutation.entity(), mutation.record_id(), &value);
                (Ok(MutationAck::new(value)), pushes)
            }
            Err(err) => (Err(err), Vec::new()),
        }
    }

    fn write(&mut self, schema: &Schema, mutation: &Mutation) -> Result<Value, GatewayError> {
        let kind = mutation.entity();
        if self.denied.contains(&kind) {
            return Err(GatewayError::permission(format!("{kind} are read-only")));
        }
        let id = mutation.record_id().clone();
        let stored = self.records.get(&(kind, id.clone())).cloned();
        let live = stored.clone().filter(|r| !is_tombstone(r));
        let fields = mutation.field_values();

        let next = match mutation {
            Mutation::Create { .. } | Mutation::AddNote { .. } => {
                if let Some(current) = live {
                    return Err(GatewayError::Conflict {
                        current: Some(current),
                    });
                }
                validate(schema.entity(kind).map(|e| e.field_errors(&fields)))?;
                // A recreated id continues the tombstone's version line.
                let version = stored.as_ref().map_or(0, version_of) + 1;
                let mut record = fields;
                record.insert("id".into(), json!(id));
                record.insert("version".into(), json!(version));
                Value::Object(record)
            }
            _ => {
                let Some(mut current) = live else {
                    return Err(GatewayError::NotFound);
                };
                if mutation.base_version() != Some(version_of(&current)) {
                    return Err(GatewayError::Conflict {
                        current: Some(current),
                    });
                }
                if matches!(mutation, Mutation::Delete { .. }) {
                    current["deleted"] = json!(true);
                } else {
                    validate(schema.entity(kind).map(|e| e.patch_errors(&fields)))?;
                    if let Some(target) = current.as_object_mut() {
                        target.extend(fields);
                    }
                }
                bump_version(&mut current);
                current
            }
        };
        self.records.insert((kind, id), next.clone());
        Ok(next)
    }
}

fn validate(errors: Option<Vec<FieldError>>) -> Result<(), GatewayError> {
    match errors {
        Some(field_errors) if !field_errors.is_empty() => {
            Err(GatewayError::Validation { field_errors })
        }
        _ => Ok(()),
    }
}

fn version_of(record: &Value) -> u64 {
    record.get("version").and_then(Value::as_u64).unwrap_or_default()
}

fn bump_version(record: &mut Value) {
    let next = version_of(record) + 1;
    if let Some(object) = record.as_object_mut() {
        object.insert("version".into(), json!(next));
    }
}
