//! End-to-end convergence tests over the in-memory hub and the relay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use tabula_core::{ReplicatedStore, Token};
use tabula_sync::{
    MemoryHub, PeerTransport, RelayClient, RelayServer, SyncEngine, SyncResult, TransportEvent,
    WireMessage,
};

const WAIT: Duration = Duration::from_secs(5);

fn tokens(ids: &[&str]) -> Vec<Token> {
    ids.iter().map(|id| Token::new(*id, *id)).collect()
}

/// Counts outbound messages so tests can assert the exchange quiesces.
struct CountingTransport<T> {
    inner: T,
    sent: Arc<AtomicUsize>,
}

impl<T: PeerTransport> PeerTransport for CountingTransport<T> {
    fn send_to_peer(&self, peer_id: Uuid, message: WireMessage) -> SyncResult<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send_to_peer(peer_id, message)
    }
}

fn spawn_peer(hub: &MemoryHub, store: Arc<ReplicatedStore>) -> (Uuid, Arc<AtomicUsize>) {
    let peer_id = Uuid::new_v4();
    let (transport, events) = hub.join(peer_id);
    let sent = Arc::new(AtomicUsize::new(0));
    let counting = CountingTransport { inner: transport, sent: sent.clone() };
    let engine = SyncEngine::new(peer_id, store, Arc::new(counting));
    tokio::spawn(engine.run(events));
    (peer_id, sent)
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_two_peers_converge_on_local_change() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(ReplicatedStore::new());
    let store_b = Arc::new(ReplicatedStore::new());
    spawn_peer(&hub, store_a.clone());
    spawn_peer(&hub, store_b.clone());

    store_a
        .change("pile:init", |state| {
            state.pile.stack = tokens(&["a", "b", "c"]);
            Ok(())
        })
        .unwrap();

    let converged = wait_until(|| {
        store_b.state().map(|s| s.pile.stack.len() == 3).unwrap_or(false)
    })
    .await;
    assert!(converged, "peer B never received the pile");
    assert_eq!(store_a.state().unwrap(), store_b.state().unwrap());
}

#[tokio::test]
async fn test_concurrent_edits_merge_to_union() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(ReplicatedStore::new());
    let store_b = Arc::new(ReplicatedStore::new());
    spawn_peer(&hub, store_a.clone());
    spawn_peer(&hub, store_b.clone());

    store_a
        .change("pile:init", |state| {
            state.pile.stack = tokens(&["a", "b"]);
            Ok(())
        })
        .unwrap();
    store_b
        .change("zone:place", |state| {
            let token = Token::new("t1", "ace");
            let placement = tabula_core::Placement::of(&token, 1.0, 2.0, true);
            state.zones.entry("table".into()).or_default().push(placement);
            Ok(())
        })
        .unwrap();

    let converged = wait_until(|| {
        let a = store_a.state().unwrap_or_default();
        let b = store_b.state().unwrap_or_default();
        a == b && a.pile.stack.len() == 2 && a.zones.get("table").map_or(false, |z| z.len() == 1)
    })
    .await;
    assert!(converged, "replicas never agreed on the union of both edits");
}

#[tokio::test]
async fn test_exchange_quiesces_without_echo() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(ReplicatedStore::new());
    let store_b = Arc::new(ReplicatedStore::new());
    let store_c = Arc::new(ReplicatedStore::new());
    let (_, sent_a) = spawn_peer(&hub, store_a.clone());
    let (_, sent_b) = spawn_peer(&hub, store_b.clone());
    let (_, sent_c) = spawn_peer(&hub, store_c.clone());

    store_a
        .change("pile:init", |state| {
            state.pile.stack = tokens(&["a"]);
            Ok(())
        })
        .unwrap();

    let converged = wait_until(|| {
        [&store_b, &store_c]
            .iter()
            .all(|store| store.state().map(|s| s.pile.stack.len() == 1).unwrap_or(false))
    })
    .await;
    assert!(converged);

    // Once everyone agrees, traffic must stop: an echoed change would keep
    // the counters climbing forever.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot: Vec<usize> =
        [&sent_a, &sent_b, &sent_c].iter().map(|c| c.load(Ordering::SeqCst)).collect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later: Vec<usize> =
        [&sent_a, &sent_b, &sent_c].iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(snapshot, later, "sync traffic kept flowing after convergence");
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(ReplicatedStore::new());
    spawn_peer(&hub, store_a.clone());

    store_a
        .change("pile:init", |state| {
            state.pile.stack = tokens(&["a", "b", "c", "d"]);
            Ok(())
        })
        .unwrap();
    store_a
        .change("pile:draw", |state| {
            state.pile.stack.pop();
            Ok(())
        })
        .unwrap();

    let store_b = Arc::new(ReplicatedStore::new());
    spawn_peer(&hub, store_b.clone());

    let converged = wait_until(|| {
        store_b.state().map(|s| s.pile.stack.len() == 3).unwrap_or(false)
    })
    .await;
    assert!(converged, "late joiner never caught up");
}

#[tokio::test]
async fn test_relay_peers_converge() {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    let url = format!("ws://{addr}");

    let peer_a = Uuid::new_v4();
    let peer_b = Uuid::new_v4();
    let (client_a, events_a) = timeout(WAIT, RelayClient::connect(&url, peer_a))
        .await
        .unwrap()
        .unwrap();
    let (client_b, events_b) = timeout(WAIT, RelayClient::connect(&url, peer_b))
        .await
        .unwrap()
        .unwrap();

    let store_a = Arc::new(ReplicatedStore::new());
    let store_b = Arc::new(ReplicatedStore::new());
    tokio::spawn(SyncEngine::new(peer_a, store_a.clone(), Arc::new(client_a)).run(events_a));
    tokio::spawn(SyncEngine::new(peer_b, store_b.clone(), Arc::new(client_b)).run(events_b));

    store_a
        .change("pile:init", |state| {
            state.pile.stack = tokens(&["a", "b"]);
            Ok(())
        })
        .unwrap();

    let converged = wait_until(|| {
        store_b.state().map(|s| s.pile.stack.len() == 2).unwrap_or(false)
    })
    .await;
    assert!(converged, "relay peers never converged");
    assert_eq!(store_a.state().unwrap(), store_b.state().unwrap());
}

#[test]
fn test_transport_event_is_send() {
    // Transport events cross task boundaries; keep them Send.
    fn assert_send<T: Send>() {}
    assert_send::<TransportEvent>();
}
