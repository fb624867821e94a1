//! Pure collection transformations over the state structs.
//!
//! These functions are the single implementation of pile, source, and zone
//! semantics. The reference backend runs them inside a document change; the
//! accelerated backend runs the same functions against its snapshot, so the
//! two paths cannot drift apart.

pub mod pile;
pub mod source;
pub mod zone;
