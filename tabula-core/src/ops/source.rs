//! Source transformations: a blended draw sequence composed from piles.

use crate::error::{CoreError, CoreResult};
use crate::rng::shuffle_slice;
use crate::state::{ReshuffleMode, ReshufflePolicy, SourceState};
use crate::token::Token;

/// Result of a source draw: the tokens taken plus whether the auto-reshuffle
/// policy fired inside the same operation.
#[derive(Debug, Clone)]
pub struct SourceDraw {
    pub tokens: Vec<Token>,
    pub reshuffled: bool,
}

/// Draw from the top (tail). If afterwards the live sequence holds
/// `threshold` or fewer tokens and the policy mode is `Auto`, the remainder
/// is re-permuted here, inside the same operation.
pub fn draw(source: &mut SourceState, count: usize) -> CoreResult<SourceDraw> {
    if count == 0 {
        return Err(CoreError::InvalidCount(count));
    }
    let take = count.min(source.tokens.len());
    let mut taken = source.tokens.split_off(source.tokens.len() - take);
    taken.reverse();

    let mut reshuffled = false;
    if source.reshuffle_policy.mode == ReshuffleMode::Auto {
        if let Some(threshold) = source.reshuffle_policy.threshold {
            if source.tokens.len() <= threshold as usize && !source.tokens.is_empty() {
                shuffle_slice(&mut source.tokens, source.seed.as_deref());
                reshuffled = true;
            }
        }
    }
    Ok(SourceDraw { tokens: taken, reshuffled })
}

/// Remove from the top into the burned history.
pub fn burn(source: &mut SourceState, count: usize) -> CoreResult<Vec<Token>> {
    if count == 0 {
        return Err(CoreError::InvalidCount(count));
    }
    let take = count.min(source.tokens.len());
    let mut taken = source.tokens.split_off(source.tokens.len() - take);
    taken.reverse();
    source.burned.extend(taken.iter().cloned());
    Ok(taken)
}

/// Permute the live sequence; a supplied seed overwrites the stored one.
pub fn shuffle(source: &mut SourceState, seed: Option<&str>) {
    if let Some(seed) = seed {
        source.seed = Some(seed.to_string());
    }
    shuffle_slice(&mut source.tokens, source.seed.as_deref());
}

/// Append a pile's snapshot tokens to the blend and record its id. Adding a
/// pile later does not re-read it; the source owns its sequence from here on.
pub fn add_pile(source: &mut SourceState, pile_id: &str, tokens: &[Token]) -> CoreResult<()> {
    if source.pile_ids.iter().any(|id| id == pile_id) {
        return Err(CoreError::DuplicatePile(pile_id.to_string()));
    }
    source.pile_ids.push(pile_id.to_string());
    source.tokens.extend(tokens.iter().map(Token::sanitized));
    Ok(())
}

/// Forget a contributing pile's id. Tokens already blended stay in the
/// sequence; only the recorded composition changes.
pub fn remove_pile(source: &mut SourceState, pile_id: &str) -> CoreResult<()> {
    let pos = source
        .pile_ids
        .iter()
        .position(|id| id == pile_id)
        .ok_or_else(|| CoreError::UnknownPile(pile_id.to_string()))?;
    source.pile_ids.remove(pos);
    Ok(())
}

/// Return all burned tokens to the bottom of the live sequence, in burn order.
pub fn restore_burned(source: &mut SourceState) -> usize {
    let restored = std::mem::take(&mut source.burned);
    let n = restored.len();
    let live = std::mem::replace(&mut source.tokens, restored);
    source.tokens.extend(live);
    n
}

pub fn set_reshuffle_policy(source: &mut SourceState, policy: ReshufflePolicy) {
    source.reshuffle_policy = policy;
}

/// Replace the live sequence and clear the burned history.
pub fn reset(source: &mut SourceState, tokens: Vec<Token>) {
    source.tokens = tokens;
    source.burned.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(ids: &[&str]) -> Vec<Token> {
        ids.iter().map(|id| Token::new(*id, *id)).collect()
    }

    fn source(ids: &[&str]) -> SourceState {
        SourceState { tokens: tokens(ids), ..Default::default() }
    }

    #[test]
    fn test_draw_top_first() {
        let mut s = source(&["a", "b", "c"]);
        let out = draw(&mut s, 2).unwrap();
        assert_eq!(out.tokens[0].id, "c");
        assert_eq!(out.tokens[1].id, "b");
        assert!(!out.reshuffled);
    }

    #[test]
    fn test_auto_reshuffle_at_threshold() {
        // Six tokens, threshold five, draw two: the remaining four must be
        // re-permuted, deterministically given the seed.
        let mut s = source(&["a", "b", "c", "d", "e", "f"]);
        s.seed = Some("game-1".into());
        s.reshuffle_policy = ReshufflePolicy { threshold: Some(5), mode: ReshuffleMode::Auto };

        let mut expected: Vec<Token> = tokens(&["a", "b", "c", "d"]);
        crate::rng::shuffle_slice(&mut expected, Some("game-1"));

        let out = draw(&mut s, 2).unwrap();
        assert!(out.reshuffled);
        assert_eq!(s.tokens, expected);
    }

    #[test]
    fn test_manual_mode_never_reshuffles() {
        let mut s = source(&["a", "b", "c"]);
        s.reshuffle_policy = ReshufflePolicy { threshold: Some(5), mode: ReshuffleMode::Manual };
        let out = draw(&mut s, 1).unwrap();
        assert!(!out.reshuffled);
        assert_eq!(s.tokens[0].id, "a");
        assert_eq!(s.tokens[1].id, "b");
    }

    #[test]
    fn test_no_threshold_no_reshuffle() {
        let mut s = source(&["a", "b"]);
        let out = draw(&mut s, 1).unwrap();
        assert!(!out.reshuffled);
    }

    #[test]
    fn test_add_pile_blends_and_records() {
        let mut s = SourceState::default();
        add_pile(&mut s, "deck-1", &tokens(&["a", "b"])).unwrap();
        add_pile(&mut s, "deck-2", &tokens(&["c"])).unwrap();
        assert_eq!(s.pile_ids, vec!["deck-1", "deck-2"]);
        assert_eq!(s.tokens.len(), 3);
        assert!(matches!(
            add_pile(&mut s, "deck-1", &[]),
            Err(CoreError::DuplicatePile(_))
        ));
    }

    #[test]
    fn test_remove_pile_keeps_tokens() {
        let mut s = SourceState::default();
        add_pile(&mut s, "deck-1", &tokens(&["a", "b"])).unwrap();
        remove_pile(&mut s, "deck-1").unwrap();
        assert!(s.pile_ids.is_empty());
        assert_eq!(s.tokens.len(), 2);
        assert!(matches!(remove_pile(&mut s, "deck-1"), Err(CoreError::UnknownPile(_))));
    }

    #[test]
    fn test_restore_burned_to_bottom() {
        let mut s = source(&["a", "b", "c"]);
        burn(&mut s, 1).unwrap();
        assert_eq!(restore_burned(&mut s), 1);
        assert_eq!(s.tokens[0].id, "c");
        assert_eq!(s.tokens.len(), 3);
        assert!(s.burned.is_empty());
    }
}
