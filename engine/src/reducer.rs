//! Pure reducers that compute optimistic cache values.
//!
//! A reducer never mutates its input: it looks at a mutation, a cache key and
//! the key's current data and says what the new data should be. Folding the
//! reducers of several mutations over an authoritative base value yields the
//! value the UI should see while those mutations are pending.

use crate::key::KeyShape;
use crate::{EntityKind, Mutation, QueryKey};
use serde_json::Value;

/// The effect of a reducer on one cache slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Leave the slot alone
    Keep,
    Replace(Value),
    /// Clear the slot's data
    Remove,
}

impl Patch {
    /// Apply the patch to `current`.
    pub fn apply(self, current: Option<&Value>) -> Option<Value> {
        match self {
            Patch::Keep => current.cloned(),
            Patch::Replace(value) => Some(value),
            Patch::Remove => None,
        }
    }
}

/// Compute the optimistic effect of `mutation` on the slot `key`.
pub fn reduce(mutation: &Mutation, key: &QueryKey, current: Option<&Value>) -> Patch {
    match key.shape() {
        KeyShape::Detail(kind, id) => {
            if kind != mutation.entity() || &id != mutation.record_id() {
                return Patch::Keep;
            }
            match apply_to_record(mutation, current) {
                Some(record) => Patch::Replace(record),
                None => Patch::Remove,
            }
        }
        KeyShape::List(kind) if kind == mutation.entity() => reduce_list(mutation, current),
        KeyShape::NotesForClient(client_id) => match mutation {
            Mutation::AddNote { client_id: c, .. } if *c == client_id => {
                reduce_list(mutation, current)
            }
            Mutation::Update { kind, .. } | Mutation::Delete { kind, .. }
                if *kind == EntityKind::Note =>
            {
                reduce_list(mutation, current)
            }
            _ => Patch::Keep,
        },
        _ => Patch::Keep,
    }
}

/// Fold `mutations`, in order, over `base` for the slot `key`.
pub fn fold<'a>(
    mutations: impl IntoIterator<Item = &'a Mutation>,
    key: &QueryKey,
    base: Option<&Value>,
) -> Option<Value> {
    mutations
        .into_iter()
        .fold(base.cloned(), |current, mutation| {
            reduce(mutation, key, current.as_ref()).apply(current.as_ref())
        })
}

/// Fold a server-confirmed record into the authoritative value of `key`.
///
/// Detail slots take the server record verbatim. Lists that were never
/// fetched stay unfetched; fetched lists get the record upserted or removed.
pub fn absorb(
    mutation: &Mutation,
    key: &QueryKey,
    base: Option<&Value>,
    server: &Value,
) -> Option<Value> {
    let removed = is_tombstone(server) || matches!(mutation, Mutation::Delete { .. });
    match key.shape() {
        KeyShape::Detail(..) => (!removed).then(|| server.clone()),
        KeyShape::List(_) | KeyShape::NotesForClient(_) => {
            let items = base?.as_array()?;
            let id = mutation.record_id().as_str();
            let mut next: Vec<Value> = items
                .iter()
                .filter(|item| record_id(item) != Some(id))
                .cloned()
                .collect();
            if !removed {
                match items.iter().position(|item| record_id(item) == Some(id)) {
                    Some(pos) => next.insert(pos, server.clone()),
                    None => next.push(server.clone()),
                }
            }
            Some(Value::Array(next))
        }
        KeyShape::Other => base.cloned(),
    }
}

/// Whether a server value marks a deleted record.
pub fn is_tombstone(value: &Value) -> bool {
    value.is_null() || value.get("deleted").and_then(Value::as_bool) == Some(true)
}

fn record_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// The record after `mutation`, or `None` when the record is gone.
fn apply_to_record(mutation: &Mutation, current: Option<&Value>) -> Option<Value> {
    match mutation {
        Mutation::Create { id, .. } | Mutation::AddNote { id, .. } => {
            let mut record = mutation.field_values();
            record.insert("id".into(), Value::String(id.clone()));
            Some(Value::Object(record))
        }
        Mutation::Delete { .. } => None,
        Mutation::Update { .. }
        | Mutation::ConfirmAppointment { .. }
        | Mutation::CancelAppointment { .. } => {
            let mut record = current?.as_object()?.clone();
            record.extend(mutation.field_values());
            Some(Value::Object(record))
        }
    }
}

fn reduce_list(mutation: &Mutation, current: Option<&Value>) -> Patch {
    let Some(items) = current.and_then(Value::as_array) else {
        return Patch::Keep;
    };
    let id = mutation.record_id().as_str();
    let exists = items.iter().any(|item| record_id(item) == Some(id));

    let next: Vec<Value> = match mutation {
        Mutation::Create { .. } | Mutation::AddNote { .. } if !exists => {
            let mut next = items.clone();
            next.extend(apply_to_record(mutation, None));
            next
        }
        Mutation::Create { .. } | Mutation::AddNote { .. } => return Patch::Keep,
        Mutation::Delete { .. } => items
            .iter()
            .filter(|item| record_id(item) != Some(id))
            .cloned()
            .collect(),
        Mutation::Update { .. }
        | Mutation::ConfirmAppointment { .. }
        | Mutation::CancelAppointment { .. } => {
            if !exists {
                return Patch::Keep;
            }
            items
                .iter()
                .map(|item| {
                    if record_id(item) == Some(id) {
                        apply_to_record(mutation, Some(item)).unwrap_or_else(|| item.clone())
                    } else {
                        item.clone()
                    }
                })
                .collect()
        }
    };
    Patch::Replace(Value::Array(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{detail_key, list_key, notes_for_client_key};
    use crate::FieldMap;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn rename(id: &str, name: &str) -> Mutation {
        Mutation::Update {
            kind: EntityKind::Client,
            id: id.into(),
            base_version: 1,
            changes: fields(json!({ "name": name })),
        }
    }

    #[test]
    fn update_patches_detail() {
        let key = detail_key(EntityKind::Client, "c1");
        let current = json!({"id": "c1", "name": "Jane", "phone": "1", "version": 1});
        let patch = reduce(&rename("c1", "Jane B"), &key, Some(&current));
        assert_eq!(
            patch,
            Patch::Replace(json!({"id": "c1", "name": "Jane B", "phone": "1", "version": 1}))
        );
    }

    #[test]
    fn update_without_data_keeps_slot_empty() {
        let key = detail_key(EntityKind::Client, "c1");
        assert_eq!(reduce(&rename("c1", "x"), &key, None), Patch::Remove);
    }

    #[test]
    fn other_records_are_untouched() {
        let key = detail_key(EntityKind::Client, "c2");
        let current = json!({"id": "c2", "name": "Bob"});
        assert_eq!(reduce(&rename("c1", "x"), &key, Some(&current)), Patch::Keep);
    }

    #[test]
    fn update_patches_list_item() {
        let key = list_key(EntityKind::Client);
        let current = json!([{"id": "c1", "name": "Jane"}, {"id": "c2", "name": "Bob"}]);
        let next = reduce(&rename("c1", "Jane B"), &key, Some(&current)).apply(Some(&current));
        assert_eq!(
            next,
            Some(json!([{"id": "c1", "name": "Jane B"}, {"id": "c2", "name": "Bob"}]))
        );
    }

    #[test]
    fn create_appends_once() {
        let key = list_key(EntityKind::Client);
        let create = Mutation::Create {
            kind: EntityKind::Client,
            id: "c3".into(),
            fields: fields(json!({"name": "Ann"})),
        };
        let current = json!([{"id": "c1", "name": "Jane"}]);
        let once = reduce(&create, &key, Some(&current)).apply(Some(&current));
        assert_eq!(
            once,
            Some(json!([{"id": "c1", "name": "Jane"}, {"name": "Ann", "id": "c3"}]))
        );
        assert_eq!(reduce(&create, &key, once.as_ref()), Patch::Keep);
    }

    #[test]
    fn unfetched_list_stays_unfetched() {
        let create = Mutation::Create {
            kind: EntityKind::Client,
            id: "c3".into(),
            fields: fields(json!({"name": "Ann"})),
        };
        assert_eq!(reduce(&create, &list_key(EntityKind::Client), None), Patch::Keep);
    }

    #[test]
    fn delete_clears_detail_and_filters_list() {
        let delete = Mutation::Delete {
            kind: EntityKind::Client,
            id: "c1".into(),
            base_version: 1,
        };
        let detail = json!({"id": "c1"});
        assert_eq!(
            reduce(&delete, &detail_key(EntityKind::Client, "c1"), Some(&detail)),
            Patch::Remove
        );
        let list = json!([{"id": "c1"}, {"id": "c2"}]);
        assert_eq!(
            reduce(&delete, &list_key(EntityKind::Client), Some(&list)),
            Patch::Replace(json!([{"id": "c2"}]))
        );
    }

    #[test]
    fn appointment_status_reducers() {
        let key = detail_key(EntityKind::Appointment, "a1");
        let current = json!({"id": "a1", "status": "booked"});
        let confirm = Mutation::ConfirmAppointment {
            id: "a1".into(),
            base_version: 1,
        };
        let confirmed = reduce(&confirm, &key, Some(&current)).apply(Some(&current));
        assert_eq!(confirmed.unwrap()["status"], "confirmed");

        let cancel = Mutation::CancelAppointment {
            id: "a1".into(),
            base_version: 1,
            reason: "sick".into(),
        };
        let cancelled = reduce(&cancel, &key, Some(&current)).apply(Some(&current)).unwrap();
        assert_eq!(cancelled["status"], "cancelled");
        assert_eq!(cancelled["cancelReason"], "sick");
    }

    #[test]
    fn add_note_patches_client_notes_only_for_that_client() {
        let note = Mutation::AddNote {
            id: "n1".into(),
            client_id: "c1".into(),
            body: "called".into(),
        };
        let mine = json!([]);
        assert_eq!(
            reduce(&note, &notes_for_client_key("c1"), Some(&mine)),
            Patch::Replace(json!([{"clientId": "c1", "body": "called", "id": "n1"}]))
        );
        assert_eq!(reduce(&note, &notes_for_client_key("c2"), Some(&mine)), Patch::Keep);
    }

    #[test]
    fn fold_applies_in_order() {
        let key = detail_key(EntityKind::Client, "c1");
        let base = json!({"id": "c1", "name": "Jane"});
        let m1 = rename("c1", "Jane B");
        let m2 = rename("c1", "Jane C");
        assert_eq!(fold([&m1, &m2], &key, Some(&base)).unwrap()["name"], "Jane C");
        assert_eq!(fold([&m2, &m1], &key, Some(&base)).unwrap()["name"], "Jane B");
        assert_eq!(fold([], &key, Some(&base)), Some(base));
    }

    #[test]
    fn absorb_takes_server_record_verbatim() {
        let server = json!({"id": "c1", "name": "Jane B", "version": 2});
        let m = rename("c1", "Jane B");
        assert_eq!(
            absorb(&m, &detail_key(EntityKind::Client, "c1"), None, &server),
            Some(server.clone())
        );

        let list = json!([{"id": "c0"}, {"id": "c1", "name": "Jane"}, {"id": "c2"}]);
        assert_eq!(
            absorb(&m, &list_key(EntityKind::Client), Some(&list), &server),
            Some(json!([{"id": "c0"}, server.clone(), {"id": "c2"}]))
        );
        assert_eq!(absorb(&m, &list_key(EntityKind::Client), None, &server), None);
    }

    #[test]
    fn absorb_tombstone_removes() {
        let m = Mutation::Delete {
            kind: EntityKind::Client,
            id: "c1".into(),
            base_version: 1,
        };
        let tombstone = json!({"id": "c1", "deleted": true, "version": 2});
        assert_eq!(
            absorb(&m, &detail_key(EntityKind::Client, "c1"), None, &tombstone),
            None
        );
        let list = json!([{"id": "c1"}, {"id": "c2"}]);
        assert_eq!(
            absorb(&m, &list_key(EntityKind::Client), Some(&list), &tombstone),
            Some(json!([{"id": "c2"}]))
        );
    }
}
