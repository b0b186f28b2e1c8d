//! Error types for the Harbor engine.

use crate::schema::FieldError;
use crate::MutationId;
use thiserror::Error;

/// All possible errors from the Harbor engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Key errors
    #[error("invalid query key: {0}")]
    InvalidKey(String),

    // Validation errors
    #[error("unknown entity kind: {0}")]
    UnknownEntity(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid fields: {}", field_names(.0))]
    InvalidFields(Vec<FieldError>),

    // Queue errors
    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("illegal transition for mutation {id}: {from} -> {to}")]
    IllegalTransition {
        id: MutationId,
        from: String,
        to: String,
    },

    #[error("mutation {0} has not been committed by the server")]
    NotCommitted(MutationId),

    #[error("mutation {0} is in flight and cannot be discarded")]
    InFlight(MutationId),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

fn field_names(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
