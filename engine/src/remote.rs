//! Outcomes reported by the remote gateway, in engine terms.
//!
//! The engine never talks to the network. The client layer calls the gateway
//! and hands the result back as a [`MutationAck`] or a [`GatewayError`].

use crate::schema::FieldError;
use crate::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A failed gateway call.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayError {
    /// Network failure, timeout or 5xx
    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("validation failed on {} field(s)", .field_errors.len())]
    #[serde(rename_all = "camelCase")]
    Validation { field_errors: Vec<FieldError> },

    #[error("permission denied: {message}")]
    Permission { message: String },

    /// The record moved on since the mutation's base version
    #[error("version conflict")]
    Conflict { current: Option<Value> },

    #[error("record not found")]
    NotFound,
}

/// What the sync layer does with a failed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Schedule another attempt after backoff
    Retry,
    /// Hand the mutation and the server state to the conflict resolver
    Resolve,
    /// Keep the mutation as a terminal failure and undo its optimistic effect
    RollBack,
    /// The record no longer exists
    Remove,
}

impl GatewayError {
    pub fn transient(message: impl Into<String>) -> Self {
        GatewayError::Transient {
            message: message.into(),
        }
    }

    /// A timed-out call.
    pub fn timeout() -> Self {
        GatewayError::transient("timed out")
    }

    pub fn permission(message: impl Into<String>) -> Self {
        GatewayError::Permission {
            message: message.into(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            GatewayError::Transient { .. } => Disposition::Retry,
            GatewayError::Conflict { .. } => Disposition::Resolve,
            GatewayError::Validation { .. } | GatewayError::Permission { .. } => {
                Disposition::RollBack
            }
            GatewayError::NotFound => Disposition::Remove,
        }
    }
}

/// The server's acknowledgement of an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAck {
    /// The record as the server now holds it (a tombstone for deletes)
    pub server_result: Value,
    pub version: Version,
}

impl MutationAck {
    pub fn new(server_result: Value) -> Self {
        let version = server_result
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Self {
            server_result,
            version,
        }
    }
}
