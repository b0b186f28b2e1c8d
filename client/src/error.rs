//! Unified error handling for the client.

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Engine error: {0}")]
    Engine(#[from] harbor_engine::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync context is shut down")]
    Closed,
}

/// Failure to read or write the persisted document.
///
/// Never fatal once the context is running: the client keeps working in
/// memory and reports degraded durability until a save succeeds.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] harbor_engine::Error),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Persist writer stopped")]
    WriterStopped,
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
