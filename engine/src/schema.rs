//! Entity kinds and their field schemas.
//!
//! The record-management domain has four entity kinds. Each kind has a field
//! schema used to validate full records (creates) and partial field patches
//! (updates). Validation collects every failing field so that the UI can
//! surface all field errors at once.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The kinds of records managed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Client,
    Professional,
    Appointment,
    Note,
}

impl EntityKind {
    /// All entity kinds, in a stable order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Client,
        EntityKind::Professional,
        EntityKind::Appointment,
        EntityKind::Note,
    ];

    /// The collection name used as the first element of query keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::Professional => "professionals",
            EntityKind::Appointment => "appointments",
            EntityKind::Note => "notes",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownEntity(s.to_string()))
    }
}

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// A single failing field, as surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<Error> for FieldError {
    fn from(err: Error) -> Self {
        let field = match &err {
            Error::MissingRequiredField(field) => field.clone(),
            Error::TypeMismatch { field, .. } => field.clone(),
            _ => String::new(),
        };
        FieldError::new(field, err.to_string())
    }
}

/// Definition of a field in an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(Value::String(s)) if self.required && s.trim().is_empty() => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(kind: EntityKind, fields: Vec<FieldDef>) -> Self {
        Self { kind, fields }
    }

    /// Validate a complete record payload, collecting every field error.
    pub fn field_errors(&self, payload: &Map<String, Value>) -> Vec<FieldError> {
        self.fields
            .iter()
            .filter_map(|field| field.validate(payload.get(&field.name)).err())
            .map(FieldError::from)
            .chain(self.unknown_fields(payload))
            .collect()
    }

    /// Validate a partial patch: only the fields present are checked.
    pub fn patch_errors(&self, changes: &Map<String, Value>) -> Vec<FieldError> {
        self.fields
            .iter()
            .filter(|field| changes.contains_key(&field.name))
            .filter_map(|field| field.validate(changes.get(&field.name)).err())
            .map(FieldError::from)
            .chain(self.unknown_fields(changes))
            .collect()
    }

    fn unknown_fields<'a>(
        &'a self,
        payload: &'a Map<String, Value>,
    ) -> impl Iterator<Item = FieldError> + 'a {
        payload
            .keys()
            .filter(|name| !self.fields.iter().any(|f| &f.name == *name))
            .map(|name| FieldError::new(name.clone(), format!("unknown field '{name}'")))
    }
}

/// Field schemas for every entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub entities: BTreeMap<EntityKind, EntitySchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    /// Builder-style method to add an entity.
    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.entities.insert(entity.kind, entity);
        self
    }

    /// Get the schema for an entity kind.
    pub fn entity(&self, kind: EntityKind) -> Option<&EntitySchema> {
        self.entities.get(&kind)
    }

    /// Validate a full record payload for `kind`, returning the first error.
    pub fn validate_payload(&self, kind: EntityKind, payload: &Value) -> Result<()> {
        let entity = self
            .entity(kind)
            .ok_or_else(|| Error::UnknownEntity(kind.to_string()))?;
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &entity.fields {
            field.validate(obj.get(&field.name))?;
        }
        Ok(())
    }
}

impl Default for Schema {
    /// The record-management schema: clients, professionals, appointments, notes.
    fn default() -> Self {
        Schema::new()
            .with_entity(EntitySchema::new(
                EntityKind::Client,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("email", FieldType::String),
                    FieldDef::optional("phone", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityKind::Professional,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("specialty", FieldType::String),
                    FieldDef::optional("email", FieldType::String),
                    FieldDef::optional("phone", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityKind::Appointment,
                vec![
                    FieldDef::required("clientId", FieldType::String),
                    FieldDef::required("professionalId", FieldType::String),
                    FieldDef::required("startsAt", FieldType::Timestamp),
                    FieldDef::optional("status", FieldType::String),
                    FieldDef::optional("cancelReason", FieldType::String),
                ],
            ))
            .with_entity(EntitySchema::new(
                EntityKind::Note,
                vec![
                    FieldDef::required("clientId", FieldType::String),
                    FieldDef::required("body", FieldType::String),
                ],
            ))
    }
}
