//! Error types for the sync layer.

use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A wire message failed validation (wrong kind, missing payload or
    /// sender). Callers log and drop; malformed input never tears down a
    /// connection.
    #[error("malformed wire message: {0}")]
    Malformed(String),

    /// Binary or JSON codec failure.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The document engine rejected a sync exchange.
    #[error("document engine error: {0}")]
    Crdt(String),

    #[error(transparent)]
    Core(#[from] tabula_core::CoreError),
}

impl From<automerge::AutomergeError> for SyncError {
    fn from(e: automerge::AutomergeError) -> Self {
        SyncError::Crdt(e.to_string())
    }
}

impl From<base64::DecodeError> for SyncError {
    fn from(e: base64::DecodeError) -> Self {
        SyncError::Malformed(format!("payload is not valid base64: {e}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}
