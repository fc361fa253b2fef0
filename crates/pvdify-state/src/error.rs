//! Error types for the Pvdify state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// The storage variants (`Open` through `Deserialize`) mean the store itself
/// misbehaved. The remaining variants are domain conditions detected inside a
/// transaction; the transaction is aborted and nothing was written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("port pool {start}-{end} exhausted")]
    PortPoolExhausted { start: u16, end: u16 },

    #[error("config key {key} not set for app {app}")]
    KeyNotFound { app: String, key: String },

    #[error("no rollback target for app {app}: {reason}")]
    NoRollbackTarget { app: String, reason: String },

    #[error("invalid release transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl StateError {
    /// True for failures of the storage engine rather than of the request.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Serialize(_)
                | StateError::Deserialize(_)
        )
    }
}
