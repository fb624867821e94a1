//! Pile transformations. Top of the pile is the tail of `stack`.

use crate::error::{CoreError, CoreResult};
use crate::rng::shuffle_slice;
use crate::state::PileState;
use crate::token::Token;

/// Remove up to `count` tokens from the top. Returns them top-first and
/// records them in the drawn history in the same order. Drawing from an
/// empty pile returns an empty vec; `count == 0` is rejected before any
/// mutation.
pub fn draw(pile: &mut PileState, count: usize) -> CoreResult<Vec<Token>> {
    if count == 0 {
        return Err(CoreError::InvalidCount(count));
    }
    let take = count.min(pile.stack.len());
    let mut taken = pile.stack.split_off(pile.stack.len() - take);
    taken.reverse();
    pile.drawn.extend(taken.iter().cloned());
    Ok(taken)
}

/// Like `draw` but the tokens go to the discard history instead.
pub fn burn(pile: &mut PileState, count: usize) -> CoreResult<Vec<Token>> {
    if count == 0 {
        return Err(CoreError::InvalidCount(count));
    }
    let take = count.min(pile.stack.len());
    let mut taken = pile.stack.split_off(pile.stack.len() - take);
    taken.reverse();
    pile.discards.extend(taken.iter().cloned());
    Ok(taken)
}

/// Permute the live sequence. A supplied seed overwrites the stored one;
/// with no seed at all the permutation is non-deterministic.
pub fn shuffle(pile: &mut PileState, seed: Option<&str>) {
    if let Some(seed) = seed {
        pile.seed = Some(seed.to_string());
    }
    shuffle_slice(&mut pile.stack, pile.seed.as_deref());
}

/// Rotate the pile at `position` cards. With `top_to_bottom` the top
/// `position` cards move beneath the rest; otherwise the bottom `position`
/// cards move on top. `position` must fall strictly inside the pile.
pub fn cut(pile: &mut PileState, position: usize, top_to_bottom: bool) -> CoreResult<()> {
    let len = pile.stack.len();
    if position == 0 || position >= len {
        return Err(CoreError::InvalidCut { position, len });
    }
    let split = if top_to_bottom { len - position } else { position };
    let upper = pile.stack.split_off(split);
    let lower = std::mem::replace(&mut pile.stack, upper);
    pile.stack.extend(lower);
    Ok(())
}

/// Insert at `index` counted from the bottom, clamped into `0..=len`.
pub fn insert_at(pile: &mut PileState, token: Token, index: i64) {
    let idx = index.clamp(0, pile.stack.len() as i64) as usize;
    pile.stack.insert(idx, token);
}

/// Remove the token at `index`. An out-of-range index removes nothing and
/// returns `None`; callers surface that as an event, not an error.
pub fn remove_at(pile: &mut PileState, index: i64) -> Option<Token> {
    if index < 0 || index >= pile.stack.len() as i64 {
        return None;
    }
    Some(pile.stack.remove(index as usize))
}

pub fn swap(pile: &mut PileState, i: usize, j: usize) -> CoreResult<()> {
    let len = pile.stack.len();
    if i >= len {
        return Err(CoreError::OutOfBounds { index: i, len });
    }
    if j >= len {
        return Err(CoreError::OutOfBounds { index: j, len });
    }
    pile.stack.swap(i, j);
    Ok(())
}

/// Reverse `start..end`. An empty range is a no-op.
pub fn reverse_range(pile: &mut PileState, start: usize, end: usize) -> CoreResult<()> {
    let len = pile.stack.len();
    if start > end || end > len {
        return Err(CoreError::InvalidRange { start, end, len });
    }
    pile.stack[start..end].reverse();
    Ok(())
}

/// Reverse the whole live sequence (bottom becomes top).
pub fn reverse(pile: &mut PileState) {
    pile.stack.reverse();
}

/// Restore the originally supplied tokens and clear both histories.
pub fn reset(pile: &mut PileState, initial: &[Token]) {
    pile.stack = initial.to_vec();
    pile.drawn.clear();
    pile.discards.clear();
}

/// Copy the top `count` tokens (top-first) without mutating anything.
pub fn peek(pile: &PileState, count: usize) -> Vec<Token> {
    let take = count.min(pile.stack.len());
    let mut out: Vec<Token> = pile.stack[pile.stack.len() - take..].to_vec();
    out.reverse();
    out
}

/// Move the most recent `count` drawn tokens into the discard history.
pub fn discard_drawn(pile: &mut PileState, count: usize) -> usize {
    let take = count.min(pile.drawn.len());
    let moved = pile.drawn.split_off(pile.drawn.len() - take);
    let n = moved.len();
    pile.discards.extend(moved);
    n
}
