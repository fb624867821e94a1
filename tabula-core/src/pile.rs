//! The draw pile component.
//!
//! A `Pile` owns no tokens itself; it expresses every operation as one atomic
//! change against the replicated document (reference backend) or against its
//! snapshot engine (accelerated backend). Reads flush a dirty accelerated
//! snapshot into the store first, so the document is authoritative at every
//! read boundary.

use std::sync::Arc;

use crate::backend::{Backend, BackendKind, SnapshotEngine};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, TableEvent};
use crate::ops;
use crate::state::PileState;
use crate::store::{Origin, ReplicatedStore};
use crate::token::Token;

/// Anything tokens can be drawn from. `deal_spread` consumes its source
/// through this seam only, so piles and sources are interchangeable there.
pub trait DrawSource {
    fn draw(&mut self, count: usize) -> CoreResult<Vec<Token>>;
}

pub struct Pile {
    id: String,
    store: Arc<ReplicatedStore>,
    events: EventBus,
    initial: Vec<Token>,
    backend: Backend,
}

impl Pile {
    /// Create a pile on the reference backend and seed the document with the
    /// given tokens.
    pub fn new(
        store: Arc<ReplicatedStore>,
        events: EventBus,
        id: impl Into<String>,
        tokens: Vec<Token>,
    ) -> CoreResult<Self> {
        Self::with_backend(store, events, id, tokens, BackendKind::Reference)
    }

    pub fn with_backend(
        store: Arc<ReplicatedStore>,
        events: EventBus,
        id: impl Into<String>,
        tokens: Vec<Token>,
        kind: BackendKind,
    ) -> CoreResult<Self> {
        let id = id.into();
        let initial: Vec<Token> = tokens.iter().map(Token::sanitized).collect();
        let seeded = initial.clone();
        store.change("pile:init", move |state| {
            state.pile = PileState { stack: seeded, ..Default::default() };
            Ok(())
        })?;
        let backend = make_backend(&store, kind)?;
        Ok(Pile { id, store, events, initial, backend })
    }

    /// Bind to the pile section already present in the document (for example
    /// after loading a saved table). The current live sequence becomes the
    /// reset baseline.
    pub fn attach(
        store: Arc<ReplicatedStore>,
        events: EventBus,
        id: impl Into<String>,
        kind: BackendKind,
    ) -> CoreResult<Self> {
        let initial = store.state()?.pile.stack;
        let backend = make_backend(&store, kind)?;
        Ok(Pile { id: id.into(), store, events, initial, backend })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The tokens this pile was created with; `reset` restores them.
    pub fn initial_tokens(&self) -> &[Token] {
        &self.initial
    }

    /// Draw up to `count` tokens from the top. An empty pile yields an empty
    /// vec and a `PileEmpty` event; `count == 0` fails before any mutation.
    pub fn draw(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        let taken = self.execute("pile:draw", move |pile| ops::pile::draw(pile, count))?;
        if taken.is_empty() {
            self.events.emit(TableEvent::PileEmpty);
        } else {
            self.events.emit(TableEvent::Draw { count: taken.len() });
        }
        Ok(taken)
    }

    pub fn burn(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        let burned = self.execute("pile:burn", move |pile| ops::pile::burn(pile, count))?;
        if burned.is_empty() {
            self.events.emit(TableEvent::PileEmpty);
        } else {
            self.events.emit(TableEvent::Burn { count: burned.len() });
        }
        Ok(burned)
    }

    /// Permute the live sequence. A supplied seed replaces the stored one and
    /// makes the permutation reproducible across replicas.
    pub fn shuffle(&mut self, seed: Option<&str>) -> CoreResult<()> {
        let seed_owned = seed.map(str::to_string);
        self.execute("pile:shuffle", move |pile| {
            ops::pile::shuffle(pile, seed_owned.as_deref());
            Ok(())
        })?;
        self.events.emit(TableEvent::Shuffle { seed: seed.map(str::to_string) });
        Ok(())
    }

    pub fn cut(&mut self, position: usize, top_to_bottom: bool) -> CoreResult<()> {
        self.execute("pile:cut", move |pile| ops::pile::cut(pile, position, top_to_bottom))?;
        self.events.emit(TableEvent::Cut { position });
        Ok(())
    }

    pub fn insert_at(&mut self, token: Token, index: i64) -> CoreResult<()> {
        let token = token.sanitized();
        self.execute("pile:insert", move |pile| {
            ops::pile::insert_at(pile, token.clone(), index);
            Ok(())
        })
    }

    /// Remove the token at `index`. An out-of-range index removes nothing,
    /// returns `None`, and emits `InvalidIndex`.
    pub fn remove_at(&mut self, index: i64) -> CoreResult<Option<Token>> {
        let removed = self.execute("pile:remove", move |pile| Ok(ops::pile::remove_at(pile, index)))?;
        if removed.is_none() {
            self.events.emit(TableEvent::InvalidIndex { index });
        }
        Ok(removed)
    }

    pub fn swap(&mut self, i: usize, j: usize) -> CoreResult<()> {
        self.execute("pile:swap", move |pile| ops::pile::swap(pile, i, j))
    }

    pub fn reverse_range(&mut self, start: usize, end: usize) -> CoreResult<()> {
        self.execute("pile:reverse-range", move |pile| ops::pile::reverse_range(pile, start, end))
    }

    pub fn reverse(&mut self) -> CoreResult<()> {
        self.execute("pile:reverse", |pile| {
            ops::pile::reverse(pile);
            Ok(())
        })
    }

    /// Restore the originally supplied tokens and clear both histories.
    pub fn reset(&mut self) -> CoreResult<()> {
        let initial = self.initial.clone();
        self.execute("pile:reset", move |pile| {
            ops::pile::reset(pile, &initial);
            Ok(())
        })?;
        self.events.emit(TableEvent::Reset);
        Ok(())
    }

    /// Move the most recent `count` drawn tokens to the discard history.
    pub fn discard_drawn(&mut self, count: usize) -> CoreResult<usize> {
        self.execute("pile:discard-drawn", move |pile| Ok(ops::pile::discard_drawn(pile, count)))
    }

    /// Copy the top `count` tokens without mutating anything.
    pub fn peek(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        Ok(ops::pile::peek(&self.state()?, count))
    }

    pub fn size(&mut self) -> CoreResult<usize> {
        Ok(self.state()?.stack.len())
    }

    /// The pile's current state, flushed and hydrated from the document.
    pub fn state(&mut self) -> CoreResult<PileState> {
        self.sync_backend()?;
        Ok(self.store.state()?.pile)
    }

    fn execute<T>(
        &mut self,
        label: &str,
        op: impl Fn(&mut PileState) -> CoreResult<T>,
    ) -> CoreResult<T> {
        match &mut self.backend {
            Backend::Reference => self.store.change(label, |state| op(&mut state.pile)),
            Backend::Accelerated(engine) => match engine.run(&op) {
                Ok(out) => Ok(out),
                Err(err) if err.is_backend_fault() => {
                    log::warn!(
                        "accelerated backend failed on '{}': {}; retrying on reference path",
                        label,
                        err
                    );
                    let restored: Result<PileState, _> = serde_json::from_str(engine.snapshot());
                    let out = match restored {
                        Ok(pile) => self.store.change(label, |state| {
                            state.pile = pile.clone();
                            op(&mut state.pile)
                        })?,
                        // Snapshot unreadable: the document is the best
                        // remaining truth.
                        Err(_) => self.store.change(label, |state| op(&mut state.pile))?,
                    };
                    engine.replace(serde_json::to_string(&self.store.state()?.pile)?);
                    Ok(out)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Flush a dirty accelerated snapshot into the store before a read.
    fn sync_backend(&mut self) -> CoreResult<()> {
        if let Backend::Accelerated(engine) = &mut self.backend {
            if engine.is_dirty() {
                let pile: PileState = serde_json::from_str(engine.snapshot())
                    .map_err(|e| CoreError::Snapshot(e.to_string()))?;
                self.store.change_tagged("pile:flush", Origin::Accel, move |state| {
                    state.pile = pile;
                    Ok(())
                })?;
                engine.mark_clean();
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_snapshot(&mut self, snapshot: String) {
        if let Backend::Accelerated(engine) = &mut self.backend {
            engine.replace(snapshot);
        }
    }
}

fn make_backend(store: &ReplicatedStore, kind: BackendKind) -> CoreResult<Backend> {
    match kind {
        BackendKind::Reference => Ok(Backend::Reference),
        BackendKind::Accelerated => {
            let snapshot = serde_json::to_string(&store.state()?.pile)?;
            Ok(Backend::Accelerated(SnapshotEngine::new(snapshot)))
        }
    }
}

impl DrawSource for Pile {
    fn draw(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        Pile::draw(self, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(ids: &[&str]) -> Vec<Token> {
        ids.iter().map(|id| Token::new(*id, *id)).collect()
    }

    fn pile_with(kind: BackendKind, ids: &[&str]) -> (Pile, Arc<ReplicatedStore>, EventBus) {
        let store = Arc::new(ReplicatedStore::new());
        let events = EventBus::new();
        let pile = Pile::with_backend(store.clone(), events.clone(), "deck-1", tokens(ids), kind)
            .unwrap();
        (pile, store, events)
    }

    #[test]
    fn test_draw_bound_semantics() {
        let (mut pile, _, _) = pile_with(BackendKind::Reference, &["a", "b"]);
        let taken = pile.draw(3).unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(pile.size().unwrap(), 0);
        let state = pile.state().unwrap();
        assert_eq!(state.drawn.len(), 2);
    }

    #[test]
    fn test_empty_draw_emits_pile_empty() {
        let (mut pile, _, events) = pile_with(BackendKind::Reference, &[]);
        let mut rx = events.subscribe();
        assert!(pile.draw(1).unwrap().is_empty());
        assert_eq!(rx.try_recv().unwrap(), TableEvent::PileEmpty);
        assert!(pile.state().unwrap().drawn.is_empty());
    }

    #[test]
    fn test_invalid_cut_mutates_nothing() {
        let (mut pile, _, _) = pile_with(BackendKind::Reference, &["a", "b", "c"]);
        assert!(pile.cut(0, true).is_err());
        assert!(pile.cut(3, true).is_err());
        let state = pile.state().unwrap();
        assert_eq!(state.stack[0].id, "a");
        assert_eq!(state.stack[2].id, "c");
    }

    #[test]
    fn test_remove_at_invalid_emits_event() {
        let (mut pile, _, events) = pile_with(BackendKind::Reference, &["a"]);
        let mut rx = events.subscribe();
        assert!(pile.remove_at(-1).unwrap().is_none());
        assert_eq!(rx.try_recv().unwrap(), TableEvent::InvalidIndex { index: -1 });
        assert_eq!(pile.size().unwrap(), 1);
    }

    #[test]
    fn test_reset_restores_initial_order() {
        let (mut pile, _, _) = pile_with(BackendKind::Reference, &["a", "b", "c"]);
        pile.shuffle(Some("s1")).unwrap();
        pile.draw(2).unwrap();
        pile.reset().unwrap();
        let state = pile.state().unwrap();
        assert_eq!(state.stack, tokens(&["a", "b", "c"]));
        assert!(state.drawn.is_empty());
        assert!(state.discards.is_empty());
    }

    #[test]
    fn test_backends_agree_on_identical_sequences() {
        let run = |kind: BackendKind| -> PileState {
            let (mut pile, _, _) = pile_with(kind, &["a", "b", "c", "d", "e", "f"]);
            pile.shuffle(Some("equiv")).unwrap();
            pile.draw(2).unwrap();
            pile.cut(2, true).unwrap();
            pile.burn(1).unwrap();
            pile.insert_at(Token::new("x", "x"), 1).unwrap();
            pile.state().unwrap()
        };
        assert_eq!(run(BackendKind::Reference), run(BackendKind::Accelerated));
    }

    #[test]
    fn test_accelerated_read_flushes_with_accel_origin() {
        let (mut pile, store, _) = pile_with(BackendKind::Accelerated, &["a", "b"]);
        let mut rx = store.subscribe();
        pile.draw(1).unwrap();
        // The write stayed in the snapshot engine; the read forces a flush.
        assert_eq!(pile.size().unwrap(), 1);
        let flushed = rx.try_recv().unwrap();
        assert_eq!(flushed.source, Origin::Accel);
        assert_eq!(store.state().unwrap().pile.drawn.len(), 1);
    }

    #[test]
    fn test_backend_fault_falls_back_per_call() {
        let (mut pile, _, _) = pile_with(BackendKind::Accelerated, &["a", "b"]);
        pile.inject_snapshot("garbage".to_string());
        // The call still succeeds, served by the reference path.
        let taken = pile.draw(1).unwrap();
        assert_eq!(taken.len(), 1);
        // No demotion: still accelerated, and healthy again.
        assert_eq!(pile.backend_kind(), BackendKind::Accelerated);
        assert_eq!(pile.size().unwrap(), 1);
        let taken = pile.draw(1).unwrap();
        assert_eq!(taken[0].id, "a");
    }

    #[test]
    fn test_semantic_errors_do_not_fall_back() {
        let (mut pile, _, _) = pile_with(BackendKind::Accelerated, &["a"]);
        assert!(matches!(pile.draw(0), Err(CoreError::InvalidCount(0))));
        assert_eq!(pile.size().unwrap(), 1);
    }
}
