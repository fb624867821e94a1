//! Peer synchronization for `tabula-core` replicated stores.
//!
//! [`SyncEngine`] drives one store: it broadcasts committed changes to every
//! peer except the change's origin and answers inbound sync messages with a
//! direct reply. Transports are collaborators behind [`PeerTransport`]: an
//! in-process [`MemoryHub`] for co-located peers and tests, and a WebSocket
//! star relay ([`RelayServer`]/[`RelayClient`]) for networked peers.

pub mod engine;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use protocol::{WireKind, WireMessage};
pub use relay::{RelayClient, RelayServer};
pub use transport::{MemoryHub, MemoryTransport, PeerTransport, TransportEvent};
