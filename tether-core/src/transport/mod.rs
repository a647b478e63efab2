//! Transport sessions wrapped by [`ReliableConnection`](crate::ReliableConnection).
//!
//! A transport is anything that can dial a [`PeerId`] and hand back a
//! [`Session`]: a raw bidirectional channel that reports `open`, `data`,
//! `close` and `error` through [`SessionEvent`]s and may drop at any time.
//!
//! Two transports ship with the crate:
//! - [`memory`]: in-process links with reachability and loss controls
//! - [`tcp`]: length-delimited JSON frames over TCP

pub mod memory;
pub mod tcp;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::envelope::{Envelope, WireEnvelope};
use crate::error::TetherError;

pub use memory::{MemoryDialer, MemoryEndpoint, MemoryNetwork};
pub use tcp::{TcpAcceptor, TcpDialer, TcpDirectory};

// ── PeerId ───────────────────────────────────────────────────────

/// Opaque identifier of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── SessionEvent ─────────────────────────────────────────────────

/// Something that happened on a transport session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session can now carry traffic.
    Open,
    /// An envelope arrived. Not yet validated.
    Data(WireEnvelope),
    /// The session closed, locally or remotely.
    Close,
    /// The transport failed. The session should be considered dead.
    Error(TetherError),
}

// ── SessionLink ──────────────────────────────────────────────────

/// The sending half a transport provides for one session.
pub trait SessionLink: Send + Sync + 'static {
    /// The transport's raw open flag.
    fn is_open(&self) -> bool;

    /// Queue an envelope for delivery while open.
    fn send(&self, envelope: WireEnvelope) -> Result<(), TetherError>;

    /// Close the session. Idempotent.
    fn close(&self);
}

// ── Session ──────────────────────────────────────────────────────

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One live transport session to a remote peer.
///
/// Dropping a session closes it.
pub struct Session {
    id: u64,
    remote: PeerId,
    link: Box<dyn SessionLink>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Session {
    pub fn new(
        remote: PeerId,
        link: impl SessionLink,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            link: Box::new(link),
            events: Some(events),
        }
    }

    /// Process-unique id, handy for telling replaced sessions apart in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), TetherError> {
        self.link.send(envelope.into())
    }

    /// Send an envelope without validating its shape.
    pub fn send_wire(&self, envelope: WireEnvelope) -> Result<(), TetherError> {
        self.link.send(envelope)
    }

    pub fn close(&self) {
        self.link.close();
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once when the transport drops its event sender and
    /// never resolves afterwards.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let event = events.recv().await;
        if event.is_none() {
            self.events = None;
        }
        event
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

// ── Dialer / Acceptor ────────────────────────────────────────────

/// Establishes outbound sessions.
///
/// `dial` must not block: it returns a session right away and reports
/// the outcome later as an `Open` or `Error` event.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, destination: &PeerId) -> Session;
}

/// Yields sessions initiated by remote peers.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<Session, TetherError>;
}

/// A link that never opened. Used when a dial fails up front.
pub(crate) struct DeadLink;

impl SessionLink for DeadLink {
    fn is_open(&self) -> bool {
        false
    }

    fn send(&self, _envelope: WireEnvelope) -> Result<(), TetherError> {
        Err(TetherError::SessionClosed)
    }

    fn close(&self) {}
}

impl Session {
    /// A session that immediately reports `error` and never opens.
    pub(crate) fn failed(remote: PeerId, error: TetherError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Error(error));
        Self::new(remote, DeadLink, rx)
    }
}
