//! Reconnection behaviour: presence signal, retry bound, inbound
//! handoff, and ordered delivery across session replacement.
//!
//! All tests run on a paused clock so retry spacing is exact.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tether_core::transport::{Acceptor, Dialer, MemoryDialer};
use tether_core::{
    ConnectionConfig, ConnectionEvent, ConnectionStatus, EventKind, MemoryNetwork, PeerId,
    ReconnectPhase, ReliableConnection,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};

const INTERVAL: Duration = Duration::from_secs(8);

// ── Helpers ──────────────────────────────────────────────────────

fn bob() -> PeerId {
    PeerId::from("bob")
}

struct Pair {
    alice: ReliableConnection,
    bob: ReliableConnection,
    /// Dials out as "bob", for hand-made sessions.
    bob_dialer: Arc<MemoryDialer>,
}

/// Two connected `ReliableConnection`s. Later inbound sessions on either
/// side are handed to that side's connection.
async fn connected_pair(net: &MemoryNetwork) -> Pair {
    let mut alice_ep = net.join("alice");
    let mut bob_ep = net.join("bob");

    let alice = ReliableConnection::dial(alice_ep.dialer(), bob(), ConnectionConfig::default());
    let first = bob_ep.accept().await.unwrap();
    let bob = ReliableConnection::from_session(bob_ep.dialer(), first, ConnectionConfig::default());
    let bob_dialer = bob_ep.dialer();

    let router = alice.clone();
    tokio::spawn(async move {
        while let Ok(session) = alice_ep.accept().await {
            let _ = router.accept_inbound_session(session);
        }
    });
    let router = bob.clone();
    tokio::spawn(async move {
        while let Ok(session) = bob_ep.accept().await {
            let _ = router.accept_inbound_session(session);
        }
    });

    Pair {
        alice,
        bob,
        bob_dialer,
    }
}

async fn wait_for_status<F>(conn: &ReliableConnection, predicate: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let mut status = conn.watch_status();
    let result = tokio::time::timeout(Duration::from_secs(600), status.wait_for(predicate))
        .await
        .expect("timeout waiting for status")
        .expect("connection task stopped");
    result.clone()
}

fn collect_data(conn: &ReliableConnection) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    conn.on(EventKind::Data, move |event| {
        if let ConnectionEvent::Data(payload) = event {
            let _ = tx.send(payload.clone());
        }
    });
    rx
}

fn count(conn: &ReliableConnection, kind: EventKind) -> Arc<AtomicU32> {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    conn.on(kind, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    hits
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reliable_order_survives_session_replacement() {
    let net = MemoryNetwork::new();
    let Pair {
        alice,
        bob: bob_conn,
        ..
    } = connected_pair(&net).await;
    let mut data = collect_data(&bob_conn);

    for i in 0..10 {
        alice.send_reliable(json!(i)).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        received.push(data.recv().await.unwrap());
    }
    net.sever(&PeerId::from("alice"), &bob());
    for i in 10..20 {
        alice.send_reliable(json!(i)).unwrap();
    }

    while received.len() < 20 {
        let next = tokio::time::timeout(Duration::from_secs(60), data.recv())
            .await
            .expect("timeout waiting for data")
            .unwrap();
        received.push(next);
    }

    let expected: Vec<Value> = (0..20).map(|i| json!(i)).collect();
    assert_eq!(received, expected);
    assert!(net.dial_count(&bob()) >= 2);

    sleep(Duration::from_millis(100)).await;
    assert!(data.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn bidirectional_reliable_traffic() {
    let net = MemoryNetwork::new();
    let Pair {
        alice,
        bob: bob_conn,
        ..
    } = connected_pair(&net).await;
    let mut at_alice = collect_data(&alice);
    let mut at_bob = collect_data(&bob_conn);

    for i in 0..5 {
        alice.send_reliable(json!(format!("a{i}"))).unwrap();
        bob_conn.send_reliable(json!(format!("b{i}"))).unwrap();
    }

    for i in 0..5 {
        assert_eq!(at_bob.recv().await, Some(json!(format!("a{i}"))));
        assert_eq!(at_alice.recv().await, Some(json!(format!("b{i}"))));
    }
}

// ── Presence ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn losing_presence_closes_immediately_once() {
    let net = MemoryNetwork::new();
    let Pair { alice, bob: _bob, .. } = connected_pair(&net).await;
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    alice.on(EventKind::Change, move |event| {
        if let ConnectionEvent::Change(open) = event {
            sink.lock().unwrap().push(*open);
        }
    });

    alice.set_peer_presence(false).unwrap();
    let status = wait_for_status(&alice, |s| !s.is_open).await;
    assert!(!status.peer_has_presence);

    alice.set_peer_presence(false).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(*changes.lock().unwrap(), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn regaining_presence_starts_reconnection() {
    let net = MemoryNetwork::new();
    let Pair { alice, bob: _bob, .. } = connected_pair(&net).await;

    net.set_reachable(&bob(), false);
    alice.set_peer_presence(false).unwrap();
    wait_for_status(&alice, |s| !s.is_open).await;
    let dials = net.dial_count(&bob());

    net.set_reachable(&bob(), true);
    alice.set_peer_presence(true).unwrap();
    let status = wait_for_status(&alice, |s| s.is_open).await;

    assert_eq!(status.reconnect, ReconnectPhase::Idle);
    assert_eq!(net.dial_count(&bob()), dials + 1);
}

#[tokio::test(start_paused = true)]
async fn presence_staying_true_does_not_redial() {
    let net = MemoryNetwork::new();
    let Pair { alice, bob: _bob, .. } = connected_pair(&net).await;

    alice.set_peer_presence(true).unwrap();
    sleep(INTERVAL * 2).await;
    assert_eq!(net.dial_count(&bob()), 1);
}

// ── Retry bound ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_evenly_spaced() {
    let net = MemoryNetwork::new();
    let alice_ep = net.join("alice");
    let _bob_ep = net.join("bob");
    net.set_reachable(&bob(), false);

    let start = Instant::now();
    let alice = ReliableConnection::dial(alice_ep.dialer(), bob(), ConnectionConfig::default());
    let exhausted = count(&alice, EventKind::Exhausted);
    let errors = count(&alice, EventKind::Error);

    // Initial dial plus the first retry happen right away.
    sleep(Duration::from_millis(1)).await;
    assert_eq!(net.dial_count(&bob()), 2);
    assert_eq!(
        alice.status().reconnect,
        ReconnectPhase::Reconnecting { attempts: 1 }
    );

    for k in 1..=4u32 {
        sleep_until(start + INTERVAL * k - Duration::from_millis(1)).await;
        assert_eq!(net.dial_count(&bob()), 1 + k);
        sleep_until(start + INTERVAL * k + Duration::from_millis(1)).await;
        assert_eq!(net.dial_count(&bob()), 2 + k);
    }

    sleep_until(start + INTERVAL * 5 + Duration::from_millis(1)).await;
    assert_eq!(
        alice.status().reconnect,
        ReconnectPhase::Exhausted { attempts: 5 }
    );
    assert_eq!(exhausted.load(Ordering::SeqCst), 1);

    sleep(Duration::from_secs(600)).await;
    assert_eq!(net.dial_count(&bob()), 6);
    assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 6);
    assert!(!alice.is_open());
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_is_pluggable() {
    let net = MemoryNetwork::new();
    let alice_ep = net.join("alice");
    let _bob_ep = net.join("bob");
    net.set_reachable(&bob(), false);

    let config = ConnectionConfig::default()
        .with_retry_limit(3)
        .with_backoff(tether_core::BackoffPolicy::Exponential {
            initial_ms: 1000,
            max_ms: 10_000,
        });
    let start = Instant::now();
    let _alice = ReliableConnection::dial(alice_ep.dialer(), bob(), config);

    sleep(Duration::from_millis(1)).await;
    assert_eq!(net.dial_count(&bob()), 2);
    sleep_until(start + Duration::from_millis(1001)).await;
    assert_eq!(net.dial_count(&bob()), 3);
    sleep_until(start + Duration::from_millis(2999)).await;
    assert_eq!(net.dial_count(&bob()), 3);
    sleep_until(start + Duration::from_millis(3001)).await;
    assert_eq!(net.dial_count(&bob()), 4);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(net.dial_count(&bob()), 4);
}

#[tokio::test(start_paused = true)]
async fn presence_revives_an_exhausted_connection() {
    let net = MemoryNetwork::new();
    let alice_ep = net.join("alice");
    let mut bob_ep = net.join("bob");
    net.set_reachable(&bob(), false);

    let alice = ReliableConnection::dial(alice_ep.dialer(), bob(), ConnectionConfig::default());
    wait_for_status(&alice, |s| {
        matches!(s.reconnect, ReconnectPhase::Exhausted { .. })
    })
    .await;

    net.set_reachable(&bob(), true);
    alice.set_peer_presence(false).unwrap();
    alice.set_peer_presence(true).unwrap();

    let _inbound = bob_ep.accept().await.unwrap();
    wait_for_status(&alice, |s| s.is_open).await;
    assert_eq!(alice.status().reconnect, ReconnectPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn explicit_reconnect_after_exhaustion() {
    let net = MemoryNetwork::new();
    let alice_ep = net.join("alice");
    let mut bob_ep = net.join("bob");
    net.set_reachable(&bob(), false);

    let alice = ReliableConnection::dial(
        alice_ep.dialer(),
        bob(),
        ConnectionConfig::default().with_retry_limit(1),
    );
    wait_for_status(&alice, |s| {
        matches!(s.reconnect, ReconnectPhase::Exhausted { attempts: 1 })
    })
    .await;

    net.set_reachable(&bob(), true);
    alice.reconnect().unwrap();

    let _inbound = bob_ep.accept().await.unwrap();
    wait_for_status(&alice, |s| s.is_open).await;
}

#[tokio::test(start_paused = true)]
async fn queued_messages_flow_once_reconnected() {
    let net = MemoryNetwork::new();
    let Pair {
        alice,
        bob: bob_conn,
        ..
    } = connected_pair(&net).await;
    let mut data = collect_data(&bob_conn);

    net.set_reachable(&bob(), false);
    wait_for_status(&alice, |s| !s.is_open).await;

    alice.send_reliable(json!("queued-1")).unwrap();
    alice.send_reliable(json!("queued-2")).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(data.try_recv().is_err());
    assert!(matches!(
        alice.status().reconnect,
        ReconnectPhase::Reconnecting { .. }
    ));

    net.set_reachable(&bob(), true);
    assert_eq!(data.recv().await, Some(json!("queued-1")));
    assert_eq!(data.recv().await, Some(json!("queued-2")));
}

// ── Inbound handoff ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn inbound_handoff_cancels_reconnection() {
    let net = MemoryNetwork::new();
    let mut alice_ep = net.join("alice");
    let bob_ep = net.join("bob");
    net.set_reachable(&bob(), false);

    let alice = ReliableConnection::dial(alice_ep.dialer(), bob(), ConnectionConfig::default());
    sleep(Duration::from_millis(1)).await;
    assert!(matches!(
        alice.status().reconnect,
        ReconnectPhase::Reconnecting { .. }
    ));
    let dials = net.dial_count(&bob());

    net.set_reachable(&bob(), true);
    let _outbound = bob_ep.dialer().dial(&PeerId::from("alice"));
    let inbound = alice_ep.accept().await.unwrap();
    alice.accept_inbound_session(inbound).unwrap();

    let status = wait_for_status(&alice, |s| s.is_open).await;
    assert_eq!(status.reconnect, ReconnectPhase::Idle);

    sleep(INTERVAL * 10).await;
    assert_eq!(net.dial_count(&bob()), dials);
    assert!(alice.is_open());
}

#[tokio::test(start_paused = true)]
async fn inbound_handoff_replaces_live_session() {
    let net = MemoryNetwork::new();
    let Pair {
        alice,
        bob: bob_conn,
        bob_dialer,
    } = connected_pair(&net).await;
    let mut at_bob = collect_data(&bob_conn);
    let closes = count(&bob_conn, EventKind::Close);

    // Bob dials Alice; Alice's router adopts it and closes the old link.
    let fresh = bob_dialer.dial(&PeerId::from("alice"));
    bob_conn.accept_inbound_session(fresh).unwrap();
    sleep(Duration::from_millis(1)).await;

    alice.send_reliable(json!("over the new link")).unwrap();
    assert_eq!(at_bob.recv().await, Some(json!("over the new link")));
    assert!(alice.is_open());
    assert!(bob_conn.is_open());
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}
