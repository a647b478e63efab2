//! In-process transport.
//!
//! A [`MemoryNetwork`] connects any number of named endpoints. Dialing a
//! reachable endpoint creates a linked session pair: both ends get an
//! `Open` event at once and the accepting end shows up on the target's
//! [`MemoryEndpoint::accept`]. The network can be told to make a peer
//! unreachable, sever links, or silently drop envelopes, which is what
//! the reconnection tests need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::WireEnvelope;
use crate::error::TetherError;
use crate::transport::{Acceptor, Dialer, PeerId, Session, SessionEvent, SessionLink};

// ── Shared state ─────────────────────────────────────────────────

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, NodeState>,
    links: Vec<Weak<LinkShared>>,
    dial_attempts: HashMap<PeerId, u32>,
    drop_next: u32,
}

struct NodeState {
    inbound: mpsc::UnboundedSender<Session>,
    reachable: bool,
}

impl NetworkState {
    fn is_reachable(&self, id: &PeerId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.reachable)
    }

    fn live_links(&mut self) -> Vec<Arc<LinkShared>> {
        self.links.retain(|l| l.strong_count() > 0);
        self.links.iter().filter_map(Weak::upgrade).collect()
    }
}

struct LinkShared {
    open: AtomicBool,
    /// Peer ids of side 0 and side 1.
    ends: [PeerId; 2],
    /// Event senders of side 0 and side 1.
    events: [mpsc::UnboundedSender<SessionEvent>; 2],
}

impl LinkShared {
    fn involves(&self, id: &PeerId) -> bool {
        self.ends.iter().any(|end| end == id)
    }

    fn connects(&self, a: &PeerId, b: &PeerId) -> bool {
        (&self.ends[0] == a && &self.ends[1] == b) || (&self.ends[0] == b && &self.ends[1] == a)
    }

    /// Close from the network side: both ends see `Close`.
    fn sever(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            for events in &self.events {
                let _ = events.send(SessionEvent::Close);
            }
        }
    }
}

// ── MemoryNetwork ────────────────────────────────────────────────

/// An in-process network of named endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        lock(&self.state)
    }

    /// Register an endpoint. Re-joining an existing id replaces its
    /// acceptor and marks it reachable.
    pub fn join(&self, id: impl Into<PeerId>) -> MemoryEndpoint {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().nodes.insert(
            id.clone(),
            NodeState {
                inbound: tx,
                reachable: true,
            },
        );
        MemoryEndpoint {
            dialer: Arc::new(MemoryDialer {
                local: id,
                network: self.clone(),
            }),
            inbound: rx,
        }
    }

    /// Toggle whether `id` can be reached. Going unreachable severs every
    /// link that involves it.
    pub fn set_reachable(&self, id: &PeerId, reachable: bool) {
        let links = {
            let mut state = self.lock();
            if let Some(node) = state.nodes.get_mut(id) {
                node.reachable = reachable;
            }
            if reachable {
                return;
            }
            state.live_links()
        };
        for link in links.iter().filter(|l| l.involves(id)) {
            link.sever();
        }
    }

    /// Sever every open link between `a` and `b`.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let links = self.lock().live_links();
        for link in links.iter().filter(|l| l.connects(a, b)) {
            link.sever();
        }
    }

    /// Silently discard the next `count` envelopes sent on any link.
    pub fn drop_next(&self, count: u32) {
        self.lock().drop_next = count;
    }

    /// How many times `id` has been dialed, successful or not.
    pub fn dial_count(&self, id: &PeerId) -> u32 {
        self.lock().dial_attempts.get(id).copied().unwrap_or(0)
    }

    fn connect(&self, from: &PeerId, to: &PeerId) -> Session {
        let mut state = self.lock();
        *state.dial_attempts.entry(to.clone()).or_default() += 1;

        if !state.is_reachable(from) || !state.is_reachable(to) {
            debug!(%from, %to, "memory dial failed: peer unreachable");
            return Session::failed(to.clone(), TetherError::PeerUnavailable(to.to_string()));
        }

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            open: AtomicBool::new(true),
            ends: [from.clone(), to.clone()],
            events: [local_tx, remote_tx],
        });
        for events in &shared.events {
            let _ = events.send(SessionEvent::Open);
        }
        state.links.push(Arc::downgrade(&shared));

        let remote = Session::new(
            from.clone(),
            MemoryLink {
                shared: shared.clone(),
                side: 1,
                network: Arc::downgrade(&self.state),
            },
            remote_rx,
        );
        let delivered = state
            .nodes
            .get(to)
            .map(|node| node.inbound.send(remote).is_ok())
            .unwrap_or(false);
        if !delivered {
            shared.sever();
        }

        debug!(%from, %to, "memory link established");
        Session::new(
            to.clone(),
            MemoryLink {
                shared,
                side: 0,
                network: Arc::downgrade(&self.state),
            },
            local_rx,
        )
    }
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── MemoryLink ───────────────────────────────────────────────────

struct MemoryLink {
    shared: Arc<LinkShared>,
    side: usize,
    network: Weak<Mutex<NetworkState>>,
}

impl MemoryLink {
    fn should_drop(&self) -> bool {
        let Some(network) = self.network.upgrade() else {
            return false;
        };
        let mut state = lock(&network);
        if state.drop_next > 0 {
            state.drop_next -= 1;
            true
        } else {
            false
        }
    }
}

impl SessionLink for MemoryLink {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: WireEnvelope) -> Result<(), TetherError> {
        if !self.is_open() {
            return Err(TetherError::SessionClosed);
        }
        if self.should_drop() {
            return Ok(());
        }
        self.shared.events[1 - self.side]
            .send(SessionEvent::Data(envelope))
            .map_err(|_| TetherError::SessionClosed)
    }

    fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            let _ = self.shared.events[1 - self.side].send(SessionEvent::Close);
        }
    }
}

// ── Endpoint / Dialer ────────────────────────────────────────────

/// One named node on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    dialer: Arc<MemoryDialer>,
    inbound: mpsc::UnboundedReceiver<Session>,
}

impl MemoryEndpoint {
    pub fn id(&self) -> &PeerId {
        &self.dialer.local
    }

    /// A dialer that connects from this endpoint.
    pub fn dialer(&self) -> Arc<MemoryDialer> {
        self.dialer.clone()
    }
}

#[async_trait]
impl Acceptor for MemoryEndpoint {
    async fn accept(&mut self) -> Result<Session, TetherError> {
        self.inbound.recv().await.ok_or(TetherError::ChannelClosed)
    }
}

/// Dials other endpoints on the same [`MemoryNetwork`].
pub struct MemoryDialer {
    local: PeerId,
    network: MemoryNetwork,
}

impl Dialer for MemoryDialer {
    fn dial(&self, destination: &PeerId) -> Session {
        self.network.connect(&self.local, destination)
    }
}
