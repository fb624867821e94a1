//! Transport collaborator seam.
//!
//! The engine never owns a socket. It sends through [`PeerTransport`] and
//! receives [`TransportEvent`]s from whatever is driving the connection —
//! the in-process [`MemoryHub`] here, or the WebSocket relay in
//! [`crate::relay`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerConnected { peer_id: Uuid },
    PeerDisconnected { peer_id: Uuid },
    Inbound { message: WireMessage },
}

/// Outbound half of a transport: deliver one message to one peer.
pub trait PeerTransport: Send + Sync {
    fn send_to_peer(&self, peer_id: Uuid, message: WireMessage) -> SyncResult<()>;
}

/// In-process full mesh over unbounded channels. Joining announces the new
/// peer to everyone already present, and vice versa, so engines see the same
/// connect events they would get from a real transport.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<TransportEvent>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, peer_id: Uuid) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.lock_peers();
        for (existing, sender) in peers.iter() {
            let _ = sender.send(TransportEvent::PeerConnected { peer_id });
            let _ = tx.send(TransportEvent::PeerConnected { peer_id: *existing });
        }
        peers.insert(peer_id, tx);
        drop(peers);
        (MemoryTransport { hub: self.clone(), from: peer_id }, rx)
    }

    pub fn leave(&self, peer_id: Uuid) {
        let mut peers = self.lock_peers();
        peers.remove(&peer_id);
        for sender in peers.values() {
            let _ = sender.send(TransportEvent::PeerDisconnected { peer_id });
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock_peers().len()
    }

    fn deliver(&self, to: Uuid, message: WireMessage) -> SyncResult<()> {
        let peers = self.lock_peers();
        let sender = peers
            .get(&to)
            .ok_or_else(|| SyncError::Transport(format!("unknown peer {to}")))?;
        sender
            .send(TransportEvent::Inbound { message })
            .map_err(|_| SyncError::Transport(format!("peer {to} receiver dropped")))
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<TransportEvent>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    from: Uuid,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> Uuid {
        self.from
    }
}

impl PeerTransport for MemoryTransport {
    fn send_to_peer(&self, peer_id: Uuid, message: WireMessage) -> SyncResult<()> {
        self.hub.deliver(peer_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireKind;

    #[test]
    fn test_join_announces_both_ways() {
        let hub = MemoryHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_ta, mut rx_a) = hub.join(a);
        let (_tb, mut rx_b) = hub.join(b);

        match rx_a.try_recv().unwrap() {
            TransportEvent::PeerConnected { peer_id } => assert_eq!(peer_id, b),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx_b.try_recv().unwrap() {
            TransportEvent::PeerConnected { peer_id } => assert_eq!(peer_id, a),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_deliver_routes_to_target_only() {
        let hub = MemoryHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let (ta, _rx_a) = hub.join(a);
        let (_tb, mut rx_b) = hub.join(b);
        let (_tc, mut rx_c) = hub.join(c);
        // Drain connect announcements.
        while rx_b.try_recv().is_ok() {}
        while rx_c.try_recv().is_ok() {}

        ta.send_to_peer(b, WireMessage::sync(a, b"x")).unwrap();
        match rx_b.try_recv().unwrap() {
            TransportEvent::Inbound { message } => assert_eq!(message.kind, WireKind::Sync),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = Uuid::new_v4();
        let (ta, _rx) = hub.join(a);
        let err = ta.send_to_peer(Uuid::new_v4(), WireMessage::join(a)).unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[test]
    fn test_leave_notifies_remaining() {
        let hub = MemoryHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_ta, mut rx_a) = hub.join(a);
        let (_tb, _rx_b) = hub.join(b);
        while rx_a.try_recv().is_ok() {}

        hub.leave(b);
        match rx_a.try_recv().unwrap() {
            TransportEvent::PeerDisconnected { peer_id } => assert_eq!(peer_id, b),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(hub.peer_count(), 1);
    }
}
