//! Star-topology WebSocket relay.
//!
//! Peers cannot always reach each other directly, so a relay server routes
//! addressed frames between them. The relay never looks inside sync payloads;
//! it registers peers on a join frame, forwards addressed frames, and fans
//! out join/leave notifications so clients see the same connect events an
//! in-process transport would produce.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{WireKind, WireMessage};
use crate::transport::{PeerTransport, TransportEvent};

/// Client-to-server envelope: the wire message plus an optional target.
/// `to: None` means fan out to every other registered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayFrame {
    to: Option<Uuid>,
    message: WireMessage,
}

impl RelayFrame {
    fn encode(&self) -> SyncResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> SyncResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(frame, _)| frame)
            .map_err(|e| SyncError::Codec(e.to_string()))
    }
}

type PeerSenders = Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<WsMessage>>>>;

pub struct RelayServer {
    listener: TcpListener,
    peers: PeerSenders,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Transport(format!("failed to bind {addr}: {e}")))?;
        Ok(RelayServer { listener, peers: Arc::new(RwLock::new(HashMap::new())) })
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> SyncResult<()> {
        log::info!("relay listening on {:?}", self.listener.local_addr().ok());
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let peers = self.peers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, peers).await {
                    log::warn!("relay connection {addr} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, peers: PeerSenders) -> SyncResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| SyncError::Transport(format!("websocket handshake with {addr} failed: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Registration: the first frame must be a join carrying the peer id.
    let peer_id = match ws_rx.next().await {
        Some(Ok(WsMessage::Binary(bytes))) => {
            let frame = RelayFrame::decode(&bytes)?;
            match (frame.message.kind, frame.message.from_peer) {
                (WireKind::Join, Some(id)) => id,
                _ => {
                    log::warn!("{addr} sent a non-join first frame, closing");
                    return Ok(());
                }
            }
        }
        _ => return Ok(()),
    };
    log::info!("relay registered peer {peer_id} from {addr}");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
    {
        let mut registry = peers.write().await;
        // Announce both ways before the new peer becomes routable.
        for (existing, sender) in registry.iter() {
            let _ = sender.send(WsMessage::Binary(WireMessage::join(peer_id).encode()?.into()));
            let _ = out_tx.send(WsMessage::Binary(WireMessage::join(*existing).encode()?.into()));
        }
        registry.insert(peer_id, out_tx);
    }

    loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    let frame = match RelayFrame::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("dropping malformed frame from {peer_id}: {e}");
                            continue;
                        }
                    };
                    route(&peers, peer_id, frame).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("websocket error from {peer_id}: {e}");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Cleanup: unregister and fan out the leave.
    let mut registry = peers.write().await;
    registry.remove(&peer_id);
    if let Ok(leave) = WireMessage::leave(peer_id).encode() {
        for sender in registry.values() {
            let _ = sender.send(WsMessage::Binary(leave.clone().into()));
        }
    }
    log::info!("relay unregistered peer {peer_id}");
    Ok(())
}

async fn route(peers: &PeerSenders, from: Uuid, frame: RelayFrame) {
    let encoded = match frame.message.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to re-encode frame from {from}: {e}");
            return;
        }
    };
    let registry = peers.read().await;
    match frame.to {
        Some(target) => match registry.get(&target) {
            Some(sender) => {
                let _ = sender.send(WsMessage::Binary(encoded.into()));
            }
            None => log::warn!("dropping frame from {from} to unknown peer {target}"),
        },
        None => {
            for (peer, sender) in registry.iter() {
                if *peer != from {
                    let _ = sender.send(WsMessage::Binary(encoded.clone().into()));
                }
            }
        }
    }
}

/// Client side of the relay. Implements [`PeerTransport`] so a `SyncEngine`
/// can address peers directly; the relay does the routing.
pub struct RelayClient {
    peer_id: Uuid,
    out_tx: mpsc::UnboundedSender<WsMessage>,
}

impl RelayClient {
    /// Connect, register with a join frame, and spawn the writer and reader
    /// tasks. Returns the client plus the event stream to hand to the engine.
    pub async fn connect(
        url: &str,
        peer_id: Uuid,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("failed to connect to {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let join = RelayFrame { to: None, message: WireMessage::join(peer_id) };
        ws_tx
            .send(WsMessage::Binary(join.encode()?.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer task.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: translate relay frames into transport events.
        tokio::spawn(async move {
            while let Some(inbound) = ws_rx.next().await {
                match inbound {
                    Ok(WsMessage::Binary(bytes)) => match WireMessage::decode(&bytes) {
                        Ok(message) => {
                            let event = match (message.kind, message.from_peer) {
                                (WireKind::Join, Some(peer_id)) => {
                                    TransportEvent::PeerConnected { peer_id }
                                }
                                (WireKind::Leave, Some(peer_id)) => {
                                    TransportEvent::PeerDisconnected { peer_id }
                                }
                                _ => TransportEvent::Inbound { message },
                            };
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("dropping malformed relay message: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("relay connection error: {e}");
                        break;
                    }
                }
            }
        });

        Ok((RelayClient { peer_id, out_tx }, event_rx))
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }
}

impl PeerTransport for RelayClient {
    fn send_to_peer(&self, peer_id: Uuid, message: WireMessage) -> SyncResult<()> {
        let frame = RelayFrame { to: Some(peer_id), message };
        self.out_tx
            .send(WsMessage::Binary(frame.encode()?.into()))
            .map_err(|_| SyncError::Transport("relay writer task stopped".into()))
    }
}
