//! Execution backends for the collection components.
//!
//! Every component picks one backend at construction. The reference backend
//! runs operations inside a document change. The accelerated backend runs the
//! same operation functions against a locally held snapshot and defers the
//! document write until a read forces a flush; its only interchange with the
//! rest of the system is a serialized JSON snapshot string.
//!
//! Backends never mirror writes. When an accelerated call fails with a
//! backend fault, the component logs a warning and re-runs that single call
//! through the reference path; there is no permanent demotion.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

/// Which execution engine a component should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Reference,
    Accelerated,
}

/// The backend a component is driving.
pub enum Backend {
    Reference,
    Accelerated(SnapshotEngine),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Reference => BackendKind::Reference,
            Backend::Accelerated(_) => BackendKind::Accelerated,
        }
    }
}

/// Holds one component's state as a JSON snapshot string and runs operations
/// against it. `dirty` marks snapshot versions not yet flushed to the store.
pub struct SnapshotEngine {
    snapshot: String,
    dirty: bool,
}

impl SnapshotEngine {
    pub fn new(snapshot: String) -> Self {
        SnapshotEngine { snapshot, dirty: false }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the snapshot with a freshly flushed one.
    pub fn replace(&mut self, snapshot: String) {
        self.snapshot = snapshot;
        self.dirty = false;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Decode the snapshot, run the operation, re-encode.
    ///
    /// Decode/encode failures surface as `CoreError::Snapshot` (a backend
    /// fault); errors from the operation itself pass through untouched and
    /// leave the snapshot as it was.
    pub fn run<S, T>(&mut self, op: impl FnOnce(&mut S) -> CoreResult<T>) -> CoreResult<T>
    where
        S: Serialize + DeserializeOwned,
    {
        let mut state: S = serde_json::from_str(&self.snapshot)
            .map_err(|e| CoreError::Snapshot(e.to_string()))?;
        let out = op(&mut state)?;
        self.snapshot =
            serde_json::to_string(&state).map_err(|e| CoreError::Snapshot(e.to_string()))?;
        self.dirty = true;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::state::PileState;
    use crate::token::Token;

    fn pile_snapshot(ids: &[&str]) -> String {
        let pile = PileState {
            stack: ids.iter().map(|id| Token::new(*id, *id)).collect(),
            ..Default::default()
        };
        serde_json::to_string(&pile).unwrap()
    }

    #[test]
    fn test_run_updates_snapshot_and_marks_dirty() {
        let mut engine = SnapshotEngine::new(pile_snapshot(&["a", "b"]));
        assert!(!engine.is_dirty());
        let drawn = engine
            .run(|pile: &mut PileState| ops::pile::draw(pile, 1))
            .unwrap();
        assert_eq!(drawn[0].id, "b");
        assert!(engine.is_dirty());
        let pile: PileState = serde_json::from_str(engine.snapshot()).unwrap();
        assert_eq!(pile.stack.len(), 1);
        assert_eq!(pile.drawn.len(), 1);
    }

    #[test]
    fn test_op_error_leaves_snapshot_untouched() {
        let mut engine = SnapshotEngine::new(pile_snapshot(&["a"]));
        let before = engine.snapshot().to_string();
        let err = engine
            .run(|pile: &mut PileState| ops::pile::draw(pile, 0))
            .unwrap_err();
        assert!(!err.is_backend_fault());
        assert_eq!(engine.snapshot(), before);
        assert!(!engine.is_dirty());
    }

    #[test]
    fn test_corrupt_snapshot_is_a_backend_fault() {
        let mut engine = SnapshotEngine::new("not json".to_string());
        let err = engine
            .run(|pile: &mut PileState| ops::pile::draw(pile, 1))
            .unwrap_err();
        assert!(err.is_backend_fault());
    }

    #[test]
    fn test_replace_clears_dirty() {
        let mut engine = SnapshotEngine::new(pile_snapshot(&["a"]));
        engine
            .run(|pile: &mut PileState| ops::pile::draw(pile, 1))
            .unwrap();
        assert!(engine.is_dirty());
        engine.replace(pile_snapshot(&["a"]));
        assert!(!engine.is_dirty());
    }
}
