//! User-facing notices raised by the sync layer.

use crate::schema::FieldError;
use crate::{EntityKind, MutationId, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Something the user should be told about a mutation they issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: Uuid,
    pub mutation_id: MutationId,
    pub entity: EntityKind,
    pub record_id: RecordId,
    pub kind: NoticeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NoticeKind {
    /// Local edits lost to newer server values
    FieldsOverwritten { fields: BTreeSet<String> },
    /// The record was deleted elsewhere
    RecordRemoved,
    #[serde(rename_all = "camelCase")]
    ValidationFailed { field_errors: Vec<FieldError> },
    PermissionDenied { message: String },
    #[serde(rename_all = "camelCase")]
    RetriesExhausted { last_error: String },
}

impl Notice {
    pub fn new(
        mutation_id: MutationId,
        entity: EntityKind,
        record_id: RecordId,
        kind: NoticeKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mutation_id,
            entity,
            record_id,
            kind,
        }
    }

    /// Human readable summary.
    pub fn message(&self) -> String {
        let what = format!("{} {}", self.entity, self.record_id);
        match &self.kind {
            NoticeKind::FieldsOverwritten { fields } => {
                let names: Vec<&str> = fields.iter().map(String::as_str).collect();
                format!(
                    "Your changes to {} on {what} were overwritten by a newer edit",
                    names.join(", ")
                )
            }
            NoticeKind::RecordRemoved => format!("{what} was deleted elsewhere"),
            NoticeKind::ValidationFailed { field_errors } => {
                let names: Vec<&str> = field_errors.iter().map(|e| e.field.as_str()).collect();
                format!("The server rejected {what}: invalid {}", names.join(", "))
            }
            NoticeKind::PermissionDenied { message } => {
                format!("You are not allowed to change {what}: {message}")
            }
            NoticeKind::RetriesExhausted { last_error } => {
                format!("Could not save {what} after several attempts: {last_error}")
            }
        }
    }
}
