//! Error taxonomy for the replicated table core.
//!
//! Three families, per the system's error-handling design:
//! - pre-condition violations (`InvalidCount`, `InvalidCut`, `OutOfBounds`,
//!   `MissingTokenId`, `UnknownPile`) surface *before* any document mutation;
//! - soft policy refusals (locked zone, missing placement) are **not** errors —
//!   operations return `Ok(None)` / empty results and emit an event instead;
//! - engine and snapshot faults (`Crdt`, `Snapshot`) are isolated per call and
//!   eligible for the reference-path fallback.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Replicated document engine rejected an operation.
    #[error("document engine error: {0}")]
    Crdt(String),

    /// Serialized-snapshot interchange failed (accelerated backend boundary).
    #[error("snapshot interchange error: {0}")]
    Snapshot(String),

    /// A count argument must be a positive integer.
    #[error("invalid count: {0} (must be positive)")]
    InvalidCount(usize),

    /// A cut position must fall strictly inside the pile.
    #[error("invalid cut position {position} for pile of {len}")]
    InvalidCut { position: usize, len: usize },

    /// Index outside the live sequence.
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },

    /// Range endpoints are inverted or past the end.
    #[error("invalid range {start}..{end} for length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    /// Tokens entering a zone must carry an id.
    #[error("token has no id")]
    MissingTokenId,

    /// The referenced pile is not tracked by this source.
    #[error("pile '{0}' is not tracked by this source")]
    UnknownPile(String),

    /// The referenced pile is already tracked by this source.
    #[error("pile '{0}' is already tracked by this source")]
    DuplicatePile(String),

    /// State could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether this error came from the execution machinery rather than the
    /// operation's own semantics. Only these trigger the per-call fallback
    /// from the accelerated backend to the reference path.
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, CoreError::Crdt(_) | CoreError::Snapshot(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<automerge::AutomergeError> for CoreError {
    fn from(e: automerge::AutomergeError) -> Self {
        CoreError::Crdt(e.to_string())
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(e: base64::DecodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_fault_classification() {
        assert!(CoreError::Crdt("x".into()).is_backend_fault());
        assert!(CoreError::Snapshot("x".into()).is_backend_fault());
        assert!(!CoreError::InvalidCount(0).is_backend_fault());
        assert!(!CoreError::MissingTokenId.is_backend_fault());
    }
}
