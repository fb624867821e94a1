//! A blended draw sequence composed from several piles.
//!
//! Composition copies the piles' tokens once; afterwards the source is fully
//! independent of the piles it was built from. Its auto-reshuffle policy runs
//! inside the same atomic change as the draw that triggers it, so no replica
//! can observe a drawn-but-not-yet-reshuffled document.

use std::sync::Arc;

use crate::backend::{Backend, BackendKind, SnapshotEngine};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, TableEvent};
use crate::ops;
use crate::pile::{DrawSource, Pile};
use crate::state::{ReshufflePolicy, SourceState};
use crate::store::{Origin, ReplicatedStore};
use crate::token::Token;

pub struct Source {
    store: Arc<ReplicatedStore>,
    events: EventBus,
    initial: Vec<Token>,
    backend: Backend,
}

impl Source {
    /// Blend the initial contents of the given piles, in order, into one
    /// draw sequence and seed the document's source section with it.
    pub fn compose(
        store: Arc<ReplicatedStore>,
        events: EventBus,
        piles: &[&Pile],
        kind: BackendKind,
    ) -> CoreResult<Self> {
        let mut blended = SourceState::default();
        for pile in piles {
            ops::source::add_pile(&mut blended, pile.id(), pile.initial_tokens())?;
        }
        let initial = blended.tokens.clone();
        let seeded = blended;
        store.change("source:init", move |state| {
            state.source = seeded;
            Ok(())
        })?;
        let backend = make_backend(&store, kind)?;
        Ok(Source { store, events, initial, backend })
    }

    /// Draw from the top. If the remaining sequence hits the reshuffle
    /// threshold in auto mode, the reshuffle happens inside this same change.
    pub fn draw(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        let (outcome, remaining) = self.execute("source:draw", move |source| {
            let outcome = ops::source::draw(source, count)?;
            Ok((outcome, source.tokens.len()))
        })?;
        if outcome.tokens.is_empty() {
            self.events.emit(TableEvent::PileEmpty);
        } else {
            self.events.emit(TableEvent::Draw { count: outcome.tokens.len() });
        }
        if outcome.reshuffled {
            self.events.emit(TableEvent::SourceReshuffled { remaining });
        }
        Ok(outcome.tokens)
    }

    pub fn burn(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        let burned = self.execute("source:burn", move |source| ops::source::burn(source, count))?;
        if burned.is_empty() {
            self.events.emit(TableEvent::PileEmpty);
        } else {
            self.events.emit(TableEvent::Burn { count: burned.len() });
        }
        Ok(burned)
    }

    pub fn shuffle(&mut self, seed: Option<&str>) -> CoreResult<()> {
        let seed_owned = seed.map(str::to_string);
        self.execute("source:shuffle", move |source| {
            ops::source::shuffle(source, seed_owned.as_deref());
            Ok(())
        })?;
        self.events.emit(TableEvent::Shuffle { seed: seed.map(str::to_string) });
        Ok(())
    }

    /// Append another pile's snapshot tokens to the blend. Fails if a pile
    /// with the same id already contributed.
    pub fn add_pile(&mut self, pile: &Pile) -> CoreResult<()> {
        let id = pile.id().to_string();
        let tokens = pile.initial_tokens().to_vec();
        self.execute("source:add-pile", move |source| {
            ops::source::add_pile(source, &id, &tokens)
        })
    }

    /// Forget a contributing pile's id. Already-blended tokens stay.
    pub fn remove_pile(&mut self, pile_id: &str) -> CoreResult<()> {
        let id = pile_id.to_string();
        self.execute("source:remove-pile", move |source| ops::source::remove_pile(source, &id))
    }

    /// Return burned tokens to the bottom of the live sequence.
    pub fn restore_burned(&mut self) -> CoreResult<usize> {
        self.execute("source:restore-burned", |source| Ok(ops::source::restore_burned(source)))
    }

    pub fn set_reshuffle_policy(&mut self, policy: ReshufflePolicy) -> CoreResult<()> {
        self.execute("source:policy", move |source| {
            ops::source::set_reshuffle_policy(source, policy.clone());
            Ok(())
        })
    }

    /// Restore the original blend and clear the burned history.
    pub fn reset(&mut self) -> CoreResult<()> {
        let initial = self.initial.clone();
        self.execute("source:reset", move |source| {
            ops::source::reset(source, initial.clone());
            Ok(())
        })?;
        self.events.emit(TableEvent::Reset);
        Ok(())
    }

    pub fn size(&mut self) -> CoreResult<usize> {
        Ok(self.state()?.tokens.len())
    }

    pub fn state(&mut self) -> CoreResult<SourceState> {
        self.sync_backend()?;
        Ok(self.store.state()?.source)
    }

    fn execute<T>(
        &mut self,
        label: &str,
        op: impl Fn(&mut SourceState) -> CoreResult<T>,
    ) -> CoreResult<T> {
        match &mut self.backend {
            Backend::Reference => self.store.change(label, |state| op(&mut state.source)),
            Backend::Accelerated(engine) => match engine.run(&op) {
                Ok(out) => Ok(out),
                Err(err) if err.is_backend_fault() => {
                    log::warn!(
                        "accelerated backend failed on '{}': {}; retrying on reference path",
                        label,
                        err
                    );
                    let restored: Result<SourceState, _> = serde_json::from_str(engine.snapshot());
                    let out = match restored {
                        Ok(source) => self.store.change(label, |state| {
                            state.source = source.clone();
                            op(&mut state.source)
                        })?,
                        Err(_) => self.store.change(label, |state| op(&mut state.source))?,
                    };
                    engine.replace(serde_json::to_string(&self.store.state()?.source)?);
                    Ok(out)
                }
                Err(err) => Err(err),
            },
        }
    }

    fn sync_backend(&mut self) -> CoreResult<()> {
        if let Backend::Accelerated(engine) = &mut self.backend {
            if engine.is_dirty() {
                let source: SourceState = serde_json::from_str(engine.snapshot())
                    .map_err(|e| CoreError::Snapshot(e.to_string()))?;
                self.store.change_tagged("source:flush", Origin::Accel, move |state| {
                    state.source = source;
                    Ok(())
                })?;
                engine.mark_clean();
            }
        }
        Ok(())
    }
}

fn make_backend(store: &ReplicatedStore, kind: BackendKind) -> CoreResult<Backend> {
    match kind {
        BackendKind::Reference => Ok(Backend::Reference),
        BackendKind::Accelerated => {
            let snapshot = serde_json::to_string(&store.state()?.source)?;
            Ok(Backend::Accelerated(SnapshotEngine::new(snapshot)))
        }
    }
}

impl DrawSource for Source {
    fn draw(&mut self, count: usize) -> CoreResult<Vec<Token>> {
        Source::draw(self, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReshuffleMode;

    fn tokens(ids: &[&str]) -> Vec<Token> {
        ids.iter().map(|id| Token::new(*id, *id)).collect()
    }

    fn table() -> (Arc<ReplicatedStore>, EventBus) {
        (Arc::new(ReplicatedStore::new()), EventBus::new())
    }

    fn source_of(ids: &[&str]) -> (Source, Arc<ReplicatedStore>, EventBus) {
        let (store, events) = table();
        let pile = Pile::new(store.clone(), events.clone(), "deck-1", tokens(ids)).unwrap();
        let source =
            Source::compose(store.clone(), events.clone(), &[&pile], BackendKind::Reference)
                .unwrap();
        (source, store, events)
    }

    #[test]
    fn test_compose_blends_in_order() {
        let (store, events) = table();
        let p1 = Pile::new(store.clone(), events.clone(), "deck-1", tokens(&["a", "b"])).unwrap();
        let p2 = Pile::new(store.clone(), events.clone(), "deck-2", tokens(&["c"])).unwrap();
        let mut source =
            Source::compose(store.clone(), events, &[&p1, &p2], BackendKind::Reference).unwrap();
        let state = source.state().unwrap();
        assert_eq!(state.pile_ids, vec!["deck-1", "deck-2"]);
        let ids: Vec<&str> = state.tokens.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_auto_reshuffle_is_one_atomic_change() {
        let (mut source, store, events) = source_of(&["a", "b", "c", "d", "e", "f"]);
        source.shuffle(Some("game-1")).unwrap();
        source
            .set_reshuffle_policy(ReshufflePolicy {
                threshold: Some(5),
                mode: ReshuffleMode::Auto,
            })
            .unwrap();

        let mut changes = store.subscribe();
        let mut bus = events.subscribe();
        let taken = source.draw(2).unwrap();
        assert_eq!(taken.len(), 2);

        // Draw plus reshuffle committed as exactly one document version.
        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_err());

        let mut saw_reshuffle = false;
        while let Ok(event) = bus.try_recv() {
            if let TableEvent::SourceReshuffled { remaining } = event {
                assert_eq!(remaining, 4);
                saw_reshuffle = true;
            }
        }
        assert!(saw_reshuffle);
    }

    #[test]
    fn test_reshuffle_determinism_across_replicas() {
        let run = || {
            let (mut source, _, _) = source_of(&["a", "b", "c", "d", "e", "f"]);
            source.shuffle(Some("game-1")).unwrap();
            source
                .set_reshuffle_policy(ReshufflePolicy {
                    threshold: Some(5),
                    mode: ReshuffleMode::Auto,
                })
                .unwrap();
            source.draw(2).unwrap();
            source.state().unwrap().tokens
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_add_and_remove_pile() {
        let (mut source, store, events) = source_of(&["a", "b"]);
        let other = Pile::new(store, events, "deck-2", tokens(&["c"])).unwrap();
        source.add_pile(&other).unwrap();
        assert_eq!(source.size().unwrap(), 3);
        assert!(matches!(source.add_pile(&other), Err(CoreError::DuplicatePile(_))));

        source.remove_pile("deck-2").unwrap();
        // Blended tokens stay; only the recorded composition changes.
        assert_eq!(source.size().unwrap(), 3);
        assert!(matches!(source.remove_pile("deck-2"), Err(CoreError::UnknownPile(_))));
    }

    #[test]
    fn test_burn_and_restore() {
        let (mut source, _, _) = source_of(&["a", "b", "c"]);
        let burned = source.burn(2).unwrap();
        assert_eq!(burned.len(), 2);
        assert_eq!(source.size().unwrap(), 1);
        assert_eq!(source.restore_burned().unwrap(), 2);
        assert_eq!(source.size().unwrap(), 3);
        assert!(source.state().unwrap().burned.is_empty());
    }

    #[test]
    fn test_backends_agree() {
        let run = |kind: BackendKind| {
            let (store, events) = table();
            let pile =
                Pile::new(store.clone(), events.clone(), "deck-1", tokens(&["a", "b", "c", "d"]))
                    .unwrap();
            let mut source = Source::compose(store, events, &[&pile], kind).unwrap();
            source.shuffle(Some("k")).unwrap();
            source.draw(2).unwrap();
            source.burn(1).unwrap();
            source.state().unwrap()
        };
        assert_eq!(run(BackendKind::Reference), run(BackendKind::Accelerated));
    }
}
