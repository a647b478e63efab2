//! Reliable, self-healing connection to a single remote peer.
//!
//! A [`ReliableConnection`] wraps one transport [`Session`] at a time and
//! hides its churn from callers:
//!
//! - **Status**: an `is_open` flag, asserted as soon as any data arrives
//!   and cleared on close, error, or lost peer presence.
//! - **Reconnection**: one bounded sequence of dials at a time, triggered
//!   by transport errors, restored presence, or a reliable send finding
//!   the transport closed.
//! - **Reliable delivery**: a FIFO of payloads sent one at a time, each
//!   retransmitted until the peer acknowledges its fingerprint.
//! - **Events**: `data`, `open`, `close`, `error`, `change` and
//!   `exhausted` listeners, invoked in registration order.
//!
//! The handle is cheap to clone. All state lives in a background task;
//! dropping every handle (or calling [`close`](ReliableConnection::close))
//! stops it and closes the session.

mod actor;
pub mod config;
pub mod listeners;
pub mod reconnect;
pub mod timer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::envelope::Payload;
use crate::error::TetherError;
use crate::fingerprint::Fingerprint;
use crate::transport::{Dialer, PeerId, Session};
use actor::{Command, ConnectionActor};

pub use config::{BackoffPolicy, ConnectionConfig};
pub use listeners::{ConnectionEvent, EventKind, ListenerId};
pub use reconnect::ReconnectPhase;

/// Point-in-time view of a connection, published after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub is_open: bool,
    pub peer_has_presence: bool,
    pub reconnect: ReconnectPhase,
    /// Reliable payloads waiting behind the in-flight one.
    pub queued: usize,
    pub in_flight: Option<Fingerprint>,
}

/// Handle to a reliable connection. See the [module docs](self).
#[derive(Clone)]
pub struct ReliableConnection {
    destination: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    next_listener: Arc<AtomicU64>,
}

impl ReliableConnection {
    /// Dial `destination` and manage the resulting session.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dial(dialer: Arc<dyn Dialer>, destination: PeerId, config: ConnectionConfig) -> Self {
        let session = dialer.dial(&destination);
        Self::spawn(dialer, destination, session, config)
    }

    /// Manage a session the remote peer initiated. `dialer` is used for
    /// any later reconnection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_session(dialer: Arc<dyn Dialer>, session: Session, config: ConnectionConfig) -> Self {
        let destination = session.remote().clone();
        Self::spawn(dialer, destination, session, config)
    }

    fn spawn(
        dialer: Arc<dyn Dialer>,
        destination: PeerId,
        session: Session,
        config: ConnectionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (actor, status) = ConnectionActor::new(destination.clone(), dialer, session, config, rx);
        tokio::spawn(actor.run());

        Self {
            destination,
            commands: tx,
            status,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    fn command(&self, command: Command) -> Result<(), TetherError> {
        self.commands.send(command)?;
        Ok(())
    }

    pub fn destination(&self) -> &PeerId {
        &self.destination
    }

    /// Fire-and-forget. Dropped silently if the transport is down.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), TetherError> {
        self.command(Command::Send(payload.into()))
    }

    /// Queue a payload for reliable, ordered delivery, or pass `None` to
    /// just nudge the queue forward.
    pub fn send_reliable(&self, payload: impl Into<Option<Payload>>) -> Result<(), TetherError> {
        self.command(Command::SendReliable(payload.into()))
    }

    /// Register a listener and return the handle for chaining. On a
    /// stopped connection the listener is dropped.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&ConnectionEvent) + Send + 'static,
    {
        if let Err(e) = self.subscribe(kind, listener) {
            debug!(peer = %self.destination, ?kind, "listener not registered: {e}");
        }
        self
    }

    /// Register a listener and return an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Result<ListenerId, TetherError>
    where
        F: Fn(&ConnectionEvent) + Send + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.command(Command::Subscribe {
            id,
            kind,
            listener: Box::new(listener),
        })?;
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> Result<(), TetherError> {
        self.command(Command::Unsubscribe(id))
    }

    /// Report whether the peer currently has presence with the
    /// rendezvous. Losing presence closes the connection at once;
    /// regaining it starts a reconnection sequence.
    pub fn set_peer_presence(&self, present: bool) -> Result<(), TetherError> {
        self.command(Command::SetPeerPresence(present))
    }

    /// Replace the current session with one the peer dialed in on.
    /// Cancels any running reconnection sequence.
    pub fn accept_inbound_session(&self, session: Session) -> Result<(), TetherError> {
        self.command(Command::AcceptInbound(session))
    }

    /// Start a fresh reconnection sequence, including after exhaustion.
    pub fn reconnect(&self) -> Result<(), TetherError> {
        self.command(Command::Reconnect)
    }

    /// Stop the connection task and close the session.
    /// Idempotent.
    pub fn close(&self) {
        if self.command(Command::Close).is_err() {
            debug!(peer = %self.destination, "connection already stopped");
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.borrow().is_open
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified whenever the status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

impl std::fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableConnection")
            .field("destination", &self.destination)
            .field("status", &*self.status.borrow())
            .finish()
    }
}
