//! Query keys: canonical, ordered tuples of primitives.
//!
//! Two structurally equal keys always address the same cache slot. The
//! canonical string form (a compact JSON array) is what gets persisted and is
//! also the key used in the persisted `cache` map.

use crate::{error::Result, EntityKind, Error, RecordId};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// A single primitive element of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeyPart {
    fn to_value(&self) -> Value {
        match self {
            KeyPart::Null => Value::Null,
            KeyPart::Bool(b) => Value::Bool(*b),
            KeyPart::Int(i) => Value::from(*i),
            KeyPart::Str(s) => Value::String(s.clone()),
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(KeyPart::Null),
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(KeyPart::Int)
                .ok_or_else(|| Error::InvalidKey(format!("non-integer number {n}"))),
            Value::String(s) => Ok(KeyPart::Str(s.clone())),
            other => Err(Error::InvalidKey(format!("non-primitive key part {other}"))),
        }
    }

    /// The string content, if this part is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPart::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        KeyPart::Str(s.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(i: i64) -> Self {
        KeyPart::Int(i)
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}

impl From<EntityKind> for KeyPart {
    fn from(kind: EntityKind) -> Self {
        KeyPart::Str(kind.as_str().to_string())
    }
}

/// Build a [`QueryKey`] from heterogeneous primitives.
///
/// ```rust
/// use harbor_engine::{query_key, QueryKey};
///
/// let key = query_key!["appointments", "byDay", 20240601_i64, true];
/// assert_eq!(key.canonical(), r#"["appointments","byDay",20240601,true]"#);
/// assert_eq!(QueryKey::parse(&key.canonical()).unwrap(), key);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::from_parts(vec![$($crate::KeyPart::from($part)),*])
    };
}

/// An ordered tuple of primitives identifying a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Build a key from its parts.
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// The key's parts.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a part, builder style.
    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    /// Whether `prefix` is a leading sub-tuple of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Canonical string form: a compact JSON array.
    pub fn canonical(&self) -> String {
        let values: Vec<Value> = self.0.iter().map(KeyPart::to_value).collect();
        Value::Array(values).to_string()
    }

    /// Parse the canonical string form.
    pub fn parse(canonical: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(canonical).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let items = value
            .as_array()
            .ok_or_else(|| Error::InvalidKey(format!("expected array, got {value}")))?;
        items
            .iter()
            .map(KeyPart::from_value)
            .collect::<Result<Vec<_>>>()
            .map(QueryKey)
    }

    /// Interpret this key in terms of the record-management key layout.
    pub fn shape(&self) -> KeyShape {
        let kind = match self.0.first().and_then(KeyPart::as_str) {
            Some(name) => match name.parse::<EntityKind>() {
                Ok(kind) => kind,
                Err(_) => return KeyShape::Other,
            },
            None => return KeyShape::Other,
        };
        match &self.0[1..] {
            [KeyPart::Str(tag)] if tag == LIST => KeyShape::List(kind),
            [KeyPart::Str(tag), KeyPart::Str(id)] if tag == DETAIL => {
                KeyShape::Detail(kind, id.clone())
            }
            [KeyPart::Str(tag), KeyPart::Str(client_id)]
                if tag == BY_CLIENT && kind == EntityKind::Note =>
            {
                KeyShape::NotesForClient(client_id.clone())
            }
            _ => KeyShape::Other,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let canonical = String::deserialize(deserializer)?;
        QueryKey::parse(&canonical).map_err(de::Error::custom)
    }
}

const LIST: &str = "list";
const DETAIL: &str = "detail";
const BY_CLIENT: &str = "byClient";

/// How a key maps onto the entity layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShape {
    /// `[kind, "detail", id]`: a single record object
    Detail(EntityKind, RecordId),
    /// `[kind, "list"]`: an array of every record of a kind
    List(EntityKind),
    /// `["notes", "byClient", clientId]`: the notes of one client
    NotesForClient(RecordId),
    /// Anything else; opaque to reducers
    Other,
}

/// Key of the detail query for one record.
pub fn detail_key(kind: EntityKind, id: &str) -> QueryKey {
    query_key![kind, DETAIL, id]
}

/// Key of the list query for a kind.
pub fn list_key(kind: EntityKind) -> QueryKey {
    query_key![kind, LIST]
}

/// Key of the per-client notes list.
pub fn notes_for_client_key(client_id: &str) -> QueryKey {
    query_key![EntityKind::Note, BY_CLIENT, client_id]
}

/// A query's identity plus its per-query options.
///
/// The fetcher is the remote gateway, which routes on the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub key: QueryKey,
    /// Overrides the cache-wide stale time for this query.
    pub stale_time: Option<Duration>,
}

impl QueryDescriptor {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            stale_time: None,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}

impl From<QueryKey> for QueryDescriptor {
    fn from(key: QueryKey) -> Self {
        QueryDescriptor::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn structurally_equal_keys_share_a_slot() {
        let a = query_key!["clients", "detail", "c1"];
        let b = QueryKey::default()
            .push("clients")
            .push("detail")
            .push(String::from("c1"));

        let mut slots = HashMap::new();
        slots.insert(a.clone(), 1);
        slots.insert(b.clone(), 2);
        assert_eq!(slots.len(), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn types_are_part_of_identity() {
        assert_ne!(query_key!["page", 1_i64], query_key!["page", "1"]);
    }

    #[test]
    fn canonical_roundtrip() {
        let key = query_key!["appointments", "range", 100_i64, -5_i64, false];
        let canonical = key.canonical();
        assert_eq!(canonical, r#"["appointments","range",100,-5,false]"#);
        assert_eq!(QueryKey::parse(&canonical).unwrap(), key);

        let with_null = QueryKey::from_parts(vec![KeyPart::from("x"), KeyPart::Null]);
        assert_eq!(QueryKey::parse(&with_null.canonical()).unwrap(), with_null);
    }

    #[test]
    fn parse_rejects_non_primitives() {
        assert!(matches!(
            QueryKey::parse(r#"["clients", {"id": 1}]"#),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(QueryKey::parse(r#"["a", 1.5]"#), Err(Error::InvalidKey(_))));
        assert!(matches!(QueryKey::parse("{}"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn prefix_matching() {
        let key = detail_key(EntityKind::Client, "c1");
        assert!(key.starts_with(&query_key!["clients"]));
        assert!(key.starts_with(&query_key!["clients", "detail"]));
        assert!(!key.starts_with(&query_key!["clients", "list"]));
        assert!(key.starts_with(&QueryKey::default()));
    }

    #[test]
    fn shapes() {
        assert_eq!(
            detail_key(EntityKind::Client, "c1").shape(),
            KeyShape::Detail(EntityKind::Client, "c1".into())
        );
        assert_eq!(
            list_key(EntityKind::Appointment).shape(),
            KeyShape::List(EntityKind::Appointment)
        );
        assert_eq!(
            notes_for_client_key("c1").shape(),
            KeyShape::NotesForClient("c1".into())
        );
        assert_eq!(query_key!["invoices", "list"].shape(), KeyShape::Other);
        assert_eq!(query_key!["clients", "search", "ja"].shape(), KeyShape::Other);
    }

    #[test]
    fn serializes_as_canonical_string() {
        let key = list_key(EntityKind::Note);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#""[\"notes\",\"list\"]""#);
        let parsed: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}
