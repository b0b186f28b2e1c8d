//! Typed mutations and the records that track them through the queue.
//!
//! Every kind of write the UI can issue is a variant of [`Mutation`] with a
//! typed payload. Reducers, target-key computation and conflict merging all
//! pattern-match on it exhaustively.

use crate::key::{detail_key, list_key, notes_for_client_key};
use crate::{
    error::Result, EntityKind, Error, MutationId, QueryKey, RecordId, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field name to value patch.
pub type FieldMap = Map<String, Value>;

/// Status value written by [`Mutation::ConfirmAppointment`].
pub const STATUS_CONFIRMED: &str = "confirmed";
/// Status value written by [`Mutation::CancelAppointment`].
pub const STATUS_CANCELLED: &str = "cancelled";

/// A write issued by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    /// Create a record of any kind.
    #[serde(rename_all = "camelCase")]
    Create {
        kind: EntityKind,
        id: RecordId,
        fields: FieldMap,
    },
    /// Patch some fields of an existing record.
    #[serde(rename_all = "camelCase")]
    Update {
        kind: EntityKind,
        id: RecordId,
        base_version: Version,
        changes: FieldMap,
    },
    /// Delete a record.
    #[serde(rename_all = "camelCase")]
    Delete {
        kind: EntityKind,
        id: RecordId,
        base_version: Version,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmAppointment { id: RecordId, base_version: Version },
    #[serde(rename_all = "camelCase")]
    CancelAppointment {
        id: RecordId,
        base_version: Version,
        reason: String,
    },
    /// Attach a note to a client.
    #[serde(rename_all = "camelCase")]
    AddNote {
        id: RecordId,
        client_id: RecordId,
        body: String,
    },
}

/// The type of a mutation, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    ConfirmAppointment,
    CancelAppointment,
    AddNote,
}

/// The set of record fields a mutation writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touched {
    /// The whole record (deletes)
    All,
    Fields(BTreeSet<String>),
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::ConfirmAppointment { .. } => MutationKind::ConfirmAppointment,
            Mutation::CancelAppointment { .. } => MutationKind::CancelAppointment,
            Mutation::AddNote { .. } => MutationKind::AddNote,
        }
    }

    /// The entity kind of the record this mutation writes.
    pub fn entity(&self) -> EntityKind {
        match self {
            Mutation::Create { kind, .. }
            | Mutation::Update { kind, .. }
            | Mutation::Delete { kind, .. } => *kind,
            Mutation::ConfirmAppointment { .. } | Mutation::CancelAppointment { .. } => {
                EntityKind::Appointment
            }
            Mutation::AddNote { .. } => EntityKind::Note,
        }
    }

    /// The id of the record this mutation writes.
    pub fn record_id(&self) -> &RecordId {
        match self {
            Mutation::Create { id, .. }
            | Mutation::Update { id, .. }
            | Mutation::Delete { id, .. }
            | Mutation::ConfirmAppointment { id, .. }
            | Mutation::CancelAppointment { id, .. }
            | Mutation::AddNote { id, .. } => id,
        }
    }

    /// Detail key of the record; also the mutation's ordering lane.
    pub fn record_key(&self) -> QueryKey {
        detail_key(self.entity(), self.record_id())
    }

    /// Every cache slot this mutation patches.
    pub fn target_keys(&self) -> Vec<QueryKey> {
        let mut keys = vec![self.record_key(), list_key(self.entity())];
        if let Mutation::AddNote { client_id, .. } = self {
            keys.push(notes_for_client_key(client_id));
        }
        keys
    }

    /// The server version the mutation was issued against, if any.
    pub fn base_version(&self) -> Option<Version> {
        match self {
            Mutation::Update { base_version, .. }
            | Mutation::Delete { base_version, .. }
            | Mutation::ConfirmAppointment { base_version, .. }
            | Mutation::CancelAppointment { base_version, .. } => Some(*base_version),
            Mutation::Create { .. } | Mutation::AddNote { .. } => None,
        }
    }

    /// Fields written by this mutation's reducer.
    pub fn touched(&self) -> Touched {
        let names: BTreeSet<String> = match self {
            Mutation::Create { fields, .. } => fields.keys().cloned().collect(),
            Mutation::Update { changes, .. } => changes.keys().cloned().collect(),
            Mutation::Delete { .. } => return Touched::All,
            Mutation::ConfirmAppointment { .. } => ["status".to_string()].into(),
            Mutation::CancelAppointment { .. } => {
                ["status".to_string(), "cancelReason".to_string()].into()
            }
            Mutation::AddNote { .. } => ["clientId".to_string(), "body".to_string()].into(),
        };
        Touched::Fields(names)
    }

    /// The field values this mutation writes onto a record.
    pub fn field_values(&self) -> FieldMap {
        match self {
            Mutation::Create { fields, .. } => fields.clone(),
            Mutation::Update { changes, .. } => changes.clone(),
            Mutation::Delete { .. } => FieldMap::new(),
            Mutation::ConfirmAppointment { .. } => object(json!({"status": STATUS_CONFIRMED})),
            Mutation::CancelAppointment { reason, .. } => {
                object(json!({"status": STATUS_CANCELLED, "cancelReason": reason}))
            }
            Mutation::AddNote {
                client_id, body, ..
            } => object(json!({"clientId": client_id, "body": body})),
        }
    }

    /// The same mutation issued against a newer server version.
    pub fn rebased(&self, version: Version) -> Mutation {
        let mut next = self.clone();
        match &mut next {
            Mutation::Update { base_version, .. }
            | Mutation::Delete { base_version, .. }
            | Mutation::ConfirmAppointment { base_version, .. }
            | Mutation::CancelAppointment { base_version, .. } => *base_version = version,
            Mutation::Create { .. } | Mutation::AddNote { .. } => {}
        }
        next
    }

    /// Drop the given fields from the mutation, rebased on `version`.
    ///
    /// Returns `None` when nothing of the local change survives. A create
    /// whose record already exists turns into an update of the surviving
    /// fields.
    pub fn without_fields(&self, dropped: &BTreeSet<String>, version: Version) -> Option<Mutation> {
        let keep = |fields: &FieldMap| -> FieldMap {
            fields
                .iter()
                .filter(|(name, _)| !dropped.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        };
        let as_update = |kind: EntityKind, id: &RecordId, changes: FieldMap| {
            (!changes.is_empty()).then(|| Mutation::Update {
                kind,
                id: id.clone(),
                base_version: version,
                changes,
            })
        };

        match self {
            Mutation::Create { kind, id, fields } => as_update(*kind, id, keep(fields)),
            Mutation::Update {
                kind, id, changes, ..
            } => as_update(*kind, id, keep(changes)),
            Mutation::AddNote { id, .. } => {
                as_update(EntityKind::Note, id, keep(&self.field_values()))
            }
            Mutation::Delete { .. }
            | Mutation::ConfirmAppointment { .. }
            | Mutation::CancelAppointment { .. } => {
                if dropped.is_empty() {
                    Some(self.rebased(version))
                } else {
                    None
                }
            }
        }
    }
}

fn object(value: Value) -> FieldMap {
    match value {
        Value::Object(map) => map,
        _ => FieldMap::new(),
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Retryable,
    Terminal,
}

/// Lifecycle of a queued mutation.
///
/// ```text
/// Pending -> InFlight -> Committed
///                     -> Failed(Retryable) -> Pending (after backoff)
///                     -> Failed(Terminal)  -> Pending (manual retry) | RolledBack (discard)
///                     -> RolledBack (record gone / change superseded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Committed,
    Failed(FailureKind),
    RolledBack,
}

impl MutationStatus {
    /// Whether the mutation still contributes an optimistic value to the cache.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MutationStatus::Pending
                | MutationStatus::InFlight
                | MutationStatus::Failed(FailureKind::Retryable)
        )
    }

    fn can_become(&self, next: MutationStatus) -> bool {
        use FailureKind::*;
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, RolledBack)
                | (InFlight, Committed)
                | (InFlight, Failed(_))
                | (InFlight, Pending)
                | (InFlight, RolledBack)
                | (Failed(Retryable), Pending)
                | (Failed(Retryable), Failed(Terminal))
                | (Failed(Terminal), Pending)
                | (Failed(Terminal), RolledBack)
        )
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::InFlight => write!(f, "inFlight"),
            MutationStatus::Committed => write!(f, "committed"),
            MutationStatus::Failed(FailureKind::Retryable) => write!(f, "failed(retryable)"),
            MutationStatus::Failed(FailureKind::Terminal) => write!(f, "failed(terminal)"),
            MutationStatus::RolledBack => write!(f, "rolledBack"),
        }
    }
}

/// A mutation tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Idempotency key
    pub id: MutationId,
    pub mutation: Mutation,
    pub target_keys: Vec<QueryKey>,
    /// Cache data of each target key right before the mutation was applied
    pub previous_snapshot: BTreeMap<QueryKey, Option<Value>>,
    pub status: MutationStatus,
    pub attempt_count: u32,
    pub created_at: Timestamp,
    /// Earliest time of the next delivery attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MutationRecord {
    pub fn new(
        id: MutationId,
        mutation: Mutation,
        previous_snapshot: BTreeMap<QueryKey, Option<Value>>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            target_keys: mutation.target_keys(),
            mutation,
            previous_snapshot,
            status: MutationStatus::Pending,
            attempt_count: 0,
            created_at,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: MutationStatus) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(Error::IllegalTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn targets(&self, key: &QueryKey) -> bool {
        self.target_keys.contains(key)
    }

    /// Whether delivery may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == MutationStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rename(id: &str, name: &str) -> Mutation {
        Mutation::Update {
            kind: EntityKind::Client,
            id: id.into(),
            base_version: 1,
            changes: object(json!({ "name": name })),
        }
    }

    #[test]
    fn target_keys_cover_detail_and_lists() {
        let m = rename("c1", "Jane B");
        assert_eq!(
            m.target_keys(),
            vec![
                detail_key(EntityKind::Client, "c1"),
                list_key(EntityKind::Client)
            ]
        );

        let note = Mutation::AddNote {
            id: "n1".into(),
            client_id: "c1".into(),
            body: "hello".into(),
        };
        assert_eq!(note.target_keys().len(), 3);
        assert!(note.target_keys().contains(&notes_for_client_key("c1")));
        assert_eq!(note.record_key(), detail_key(EntityKind::Note, "n1"));
    }

    #[test]
    fn touched_fields() {
        assert_eq!(
            rename("c1", "x").touched(),
            Touched::Fields(["name".to_string()].into())
        );
        let delete = Mutation::Delete {
            kind: EntityKind::Client,
            id: "c1".into(),
            base_version: 3,
        };
        assert_eq!(delete.touched(), Touched::All);
    }

    #[test]
    fn rebased_only_changes_version() {
        let m = rename("c1", "x").rebased(7);
        assert_eq!(m.base_version(), Some(7));
        assert_eq!(m.field_values(), object(json!({"name": "x"})));
    }

    #[test]
    fn without_fields_drops_overlap() {
        let m = Mutation::Update {
            kind: EntityKind::Client,
            id: "c1".into(),
            base_version: 1,
            changes: object(json!({"phone": "555", "email": "a@b.c"})),
        };
        let kept = m.without_fields(&["email".to_string()].into(), 4).unwrap();
        assert_eq!(
            kept,
            Mutation::Update {
                kind: EntityKind::Client,
                id: "c1".into(),
                base_version: 4,
                changes: object(json!({"phone": "555"})),
            }
        );

        let all = ["phone".to_string(), "email".to_string()].into();
        assert!(m.without_fields(&all, 4).is_none());
    }

    #[test]
    fn without_fields_turns_create_into_update() {
        let create = Mutation::Create {
            kind: EntityKind::Client,
            id: "c1".into(),
            fields: object(json!({"name": "Jane", "phone": "555"})),
        };
        let kept = create.without_fields(&["name".to_string()].into(), 2).unwrap();
        assert_eq!(kept.kind(), MutationKind::Update);
        assert_eq!(kept.base_version(), Some(2));
    }

    #[test]
    fn lifecycle_transitions() {
        let mut record = MutationRecord::new(Uuid::new_v4(), rename("c1", "x"), BTreeMap::new(), 0);
        record.transition(MutationStatus::InFlight).unwrap();
        record
            .transition(MutationStatus::Failed(FailureKind::Retryable))
            .unwrap();
        record.transition(MutationStatus::Pending).unwrap();
        record.transition(MutationStatus::InFlight).unwrap();
        record.transition(MutationStatus::Committed).unwrap();

        let err = record.transition(MutationStatus::InFlight).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn pending_cannot_commit_without_flight() {
        let mut record = MutationRecord::new(Uuid::new_v4(), rename("c1", "x"), BTreeMap::new(), 0);
        assert!(record.transition(MutationStatus::Committed).is_err());
        assert_eq!(record.status, MutationStatus::Pending);
    }

    #[test]
    fn activity() {
        assert!(MutationStatus::Pending.is_active());
        assert!(MutationStatus::InFlight.is_active());
        assert!(!MutationStatus::Failed(FailureKind::Terminal).is_active());
        assert!(!MutationStatus::RolledBack.is_active());
        assert!(!MutationStatus::Committed.is_active());
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_value(rename("c1", "x")).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["baseVersion"], 1);

        let confirm = Mutation::ConfirmAppointment {
            id: "a1".into(),
            base_version: 2,
        };
        let json = serde_json::to_string(&confirm).unwrap();
        assert!(json.contains(r#""type":"confirmAppointment""#));
        let parsed: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, confirm);
    }

    #[test]
    fn record_roundtrip_keeps_snapshot_keys() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert(detail_key(EntityKind::Client, "c1"), Some(json!({"name": "Jane"})));
        snapshot.insert(list_key(EntityKind::Client), None);
        let record = MutationRecord::new(Uuid::new_v4(), rename("c1", "x"), snapshot, 5);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: MutationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
