//! Replicated shared-state core for token-based multiplayer games.
//!
//! The document store ([`ReplicatedStore`]) wraps a conflict-free replicated
//! document; the collection components ([`Pile`], [`Source`], [`ZoneMap`])
//! express game-table mutations as atomic document changes; the backend layer
//! lets each component run either directly against the document (reference)
//! or against a serialized snapshot (accelerated) with identical semantics.
//!
//! Peer synchronization lives in the companion `tabula-sync` crate; this
//! crate only emits [`StateChanged`] notifications tagged with an [`Origin`].

pub mod backend;
pub mod error;
pub mod events;
pub mod ops;
pub mod pile;
pub mod rng;
pub mod source;
pub mod state;
pub mod store;
pub mod token;
pub mod zones;

pub use backend::{Backend, BackendKind, SnapshotEngine};
pub use error::{CoreError, CoreResult};
pub use events::{EventBus, TableEvent};
pub use ops::zone::SpreadLayout;
pub use pile::{DrawSource, Pile};
pub use source::Source;
pub use state::{
    Placement, PileState, ReshuffleMode, ReshufflePolicy, SourceState, TableState, ZoneLock,
    Zones, ZonesSnapshot,
};
pub use store::{Origin, ReplicatedStore, StateChanged};
pub use token::Token;
pub use zones::ZoneMap;
