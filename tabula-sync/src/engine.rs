//! The peer synchronization engine.
//!
//! One engine serves one store. It keeps a per-peer sync state (created on
//! connect or lazily on first message, discarded on disconnect, never
//! persisted) and runs a two-message pattern: every committed change fans out
//! one sync message to each peer except the change's origin, and every
//! inbound sync message is answered with one reply to its sender only. The
//! origin tag on [`StateChanged`] is the sole echo-suppression mechanism.
//!
//! Failures are isolated per exchange: a malformed or inapplicable message is
//! logged and dropped, leaving that peer's sync state untouched so the next
//! exchange starts from the last good point.

use std::collections::HashMap;
use std::sync::Arc;

use automerge::sync::{self, SyncDoc};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use tabula_core::{Origin, ReplicatedStore, StateChanged};

use crate::protocol::{WireKind, WireMessage};
use crate::transport::{PeerTransport, TransportEvent};

pub struct SyncEngine {
    local_id: Uuid,
    store: Arc<ReplicatedStore>,
    transport: Arc<dyn PeerTransport>,
    peers: HashMap<Uuid, sync::State>,
}

impl SyncEngine {
    pub fn new(local_id: Uuid, store: Arc<ReplicatedStore>, transport: Arc<dyn PeerTransport>) -> Self {
        SyncEngine { local_id, store, transport, peers: HashMap::new() }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Drive the engine until the store or the transport goes away.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut changes = self.store.subscribe();
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(changed) => self.broadcast(&changed),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped notifications carry no state; resync every
                        // peer from the current document.
                        log::warn!("change stream lagged by {missed}; resyncing all peers");
                        let doc = self.store.doc();
                        self.broadcast(&StateChanged { doc, source: Origin::Local });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Some(TransportEvent::PeerConnected { peer_id }) => self.on_connect(peer_id),
                    Some(TransportEvent::PeerDisconnected { peer_id }) => self.on_disconnect(peer_id),
                    Some(TransportEvent::Inbound { message }) => self.on_message(message),
                    None => break,
                },
            }
        }
        log::info!("sync engine for {} stopped", self.local_id);
    }

    /// Send one sync message to every connected peer except the change's
    /// origin peer.
    fn broadcast(&mut self, changed: &StateChanged) {
        let mut outgoing = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            if changed.source.is_peer(*peer) {
                continue;
            }
            if let Some(message) = changed.doc.generate_sync_message(state) {
                outgoing.push((*peer, message));
            }
        }
        for (peer, message) in outgoing {
            self.send_sync(peer, message);
        }
    }

    fn on_connect(&mut self, peer: Uuid) {
        log::info!("peer {peer} connected");
        let mut state = sync::State::new();
        let initial = self.store.doc().generate_sync_message(&mut state);
        self.peers.insert(peer, state);
        if let Some(message) = initial {
            self.send_sync(peer, message);
        }
    }

    fn on_disconnect(&mut self, peer: Uuid) {
        log::info!("peer {peer} disconnected");
        self.peers.remove(&peer);
    }

    fn on_message(&mut self, message: WireMessage) {
        match message.kind {
            WireKind::Sync => self.on_sync(message),
            WireKind::Join => {
                if let Some(peer) = message.from_peer {
                    self.on_connect(peer);
                }
            }
            WireKind::Leave => {
                if let Some(peer) = message.from_peer {
                    self.on_disconnect(peer);
                }
            }
        }
    }

    fn on_sync(&mut self, message: WireMessage) {
        let (payload, from) = match message.sync_payload() {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("dropping sync message: {e}");
                return;
            }
        };
        let decoded = match sync::Message::decode(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("dropping undecodable sync payload from {from}: {e}");
                return;
            }
        };

        // Work against copies; the stored doc and peer state advance only if
        // the message applies cleanly.
        let mut state = self.peers.get(&from).cloned().unwrap_or_else(sync::State::new);
        let mut doc = self.store.doc();
        if let Err(e) = doc.receive_sync_message(&mut state, decoded) {
            log::warn!("failed to apply sync message from {from}: {e}");
            return;
        }

        // Committing with the peer's tag makes the subsequent broadcast skip
        // that peer; the direct reply below is its only answer.
        self.store.update(doc.clone(), Origin::Peer(from));
        let reply = doc.generate_sync_message(&mut state);
        self.peers.insert(from, state);
        if let Some(reply) = reply {
            self.send_sync(from, reply);
        }
    }

    fn send_sync(&self, peer: Uuid, message: sync::Message) {
        let wire = WireMessage::sync(self.local_id, &message.encode());
        if let Err(e) = self.transport.send_to_peer(peer, wire) {
            log::warn!("failed to send sync message to {peer}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::SyncResult;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Uuid, WireMessage)>>,
    }

    impl RecordingTransport {
        fn sent_to(&self) -> Vec<Uuid> {
            self.sent.lock().unwrap().iter().map(|(peer, _)| *peer).collect()
        }

        fn take_first_sync(&self) -> Option<WireMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, message)| message.clone())
                .find(|message| message.kind == WireKind::Sync)
        }
    }

    impl PeerTransport for RecordingTransport {
        fn send_to_peer(&self, peer_id: Uuid, message: WireMessage) -> SyncResult<()> {
            self.sent.lock().unwrap().push((peer_id, message));
            Ok(())
        }
    }

    fn engine_with_transport() -> (SyncEngine, Arc<RecordingTransport>, Arc<ReplicatedStore>) {
        let store = Arc::new(ReplicatedStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let engine = SyncEngine::new(Uuid::new_v4(), store.clone(), transport.clone());
        (engine, transport, store)
    }

    fn seed(store: &ReplicatedStore) {
        store
            .change("pile:init", |state| {
                state.pile.stack.push(tabula_core::Token::new("a", "A"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_broadcast_skips_origin_peer() {
        let (mut engine, transport, store) = engine_with_transport();
        seed(&store);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        engine.on_connect(p1);
        engine.on_connect(p2);
        transport.sent.lock().unwrap().clear();

        engine.broadcast(&StateChanged { doc: store.doc(), source: Origin::Peer(p1) });
        let targets = transport.sent_to();
        assert!(targets.contains(&p2));
        assert!(!targets.contains(&p1));
    }

    #[test]
    fn test_connect_sends_opening_sync() {
        let (mut engine, transport, store) = engine_with_transport();
        seed(&store);
        engine.on_connect(Uuid::new_v4());
        let opening = transport.take_first_sync().expect("opening sync message");
        assert_eq!(opening.from_peer, Some(engine.local_id()));
        assert!(opening.sync_payload().is_ok());
    }

    #[test]
    fn test_malformed_sync_is_dropped_without_side_effects() {
        let (mut engine, transport, store) = engine_with_transport();
        seed(&store);
        let before = store.save();

        engine.on_message(WireMessage {
            kind: WireKind::Sync,
            data: None,
            from_peer: Some(Uuid::new_v4()),
        });
        engine.on_message(WireMessage {
            kind: WireKind::Sync,
            data: Some("%%%not-base64%%%".into()),
            from_peer: Some(Uuid::new_v4()),
        });
        engine.on_message(WireMessage {
            kind: WireKind::Sync,
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b"not a sync message",
            )),
            from_peer: Some(Uuid::new_v4()),
        });

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(store.save(), before);
        assert!(engine.peers.is_empty());
    }

    #[test]
    fn test_disconnect_discards_peer_state() {
        let (mut engine, _, _) = engine_with_transport();
        let peer = Uuid::new_v4();
        engine.on_connect(peer);
        assert!(engine.peers.contains_key(&peer));
        engine.on_disconnect(peer);
        assert!(engine.peers.is_empty());
    }
}
