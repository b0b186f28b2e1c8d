//! Conflict Resolver: field-aware last-writer-wins.
//!
//! Called when the server rejects a mutation because the record moved on
//! since the version the mutation was issued against. The resolver compares
//! the record as the mutation assumed it (its previous snapshot) with the
//! record the server holds now:
//!
//! - no overlap between the fields the mutation writes and the fields the
//!   server changed: reapply on the new state and resubmit;
//! - overlap: the server keeps the overlapping fields, the rest of the local
//!   change is resubmitted, and the overwritten fields are reported;
//! - record gone: the mutation is discarded.

use crate::reducer::is_tombstone;
use crate::{Mutation, Touched};
use serde_json::Value;
use std::collections::BTreeSet;

/// Bookkeeping fields that change on every server write.
const SERVER_MANAGED: [&str; 4] = ["id", "version", "updatedAt", "deleted"];

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Nothing the mutation writes was touched concurrently
    Resubmit(Mutation),
    /// Some fields lost to the server; the rest goes out again
    Merged {
        mutation: Mutation,
        overwritten: BTreeSet<String>,
    },
    /// Nothing of the local change survives
    Superseded { overwritten: BTreeSet<String> },
    /// The record no longer exists on the server
    Deleted,
}

/// Resolve `mutation` against the server's `current` record.
///
/// `assumed` is the record as it looked when the mutation was applied
/// locally; `None` means the client never saw it.
pub fn resolve(
    mutation: &Mutation,
    assumed: Option<&Value>,
    current: Option<&Value>,
) -> Resolution {
    let Some(current) = current.filter(|c| !is_tombstone(c)) else {
        return Resolution::Deleted;
    };
    let version = current
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    let changed = changed_fields(assumed, current);

    let overwritten: BTreeSet<String> = match mutation.touched() {
        Touched::All => changed,
        Touched::Fields(fields) => {
            let local = mutation.field_values();
            fields
                .into_iter()
                .filter(|f| changed.contains(f))
                .filter(|f| current.get(f.as_str()) != local.get(f.as_str()))
                .collect()
        }
    };

    match mutation.without_fields(&overwritten, version) {
        Some(next) if overwritten.is_empty() => Resolution::Resubmit(next),
        Some(next) => Resolution::Merged {
            mutation: next,
            overwritten,
        },
        None => Resolution::Superseded { overwritten },
    }
}

/// Fields whose value differs between `assumed` and `current`.
pub fn changed_fields(assumed: Option<&Value>, current: &Value) -> BTreeSet<String> {
    let empty = serde_json::Map::new();
    let after = current.as_object().unwrap_or(&empty);
    let before = assumed.and_then(Value::as_object);

    let mut names: BTreeSet<&String> = after.keys().collect();
    if let Some(before) = before {
        names.extend(before.keys());
    }
    names
        .into_iter()
        .filter(|name| !SERVER_MANAGED.contains(&name.as_str()))
        .filter(|name| match before {
            Some(before) => before.get(name.as_str()) != after.get(name.as_str()),
            None => true,
        })
        .cloned()
        .collect()
}
