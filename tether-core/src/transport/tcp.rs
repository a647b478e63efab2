//! TCP transport.
//!
//! Every session runs one background task that owns the framed stream:
//! it writes queued envelopes, forwards received ones as
//! [`SessionEvent::Data`], and reports `Close` or `Error` when the stream
//! ends. Dialers open with a `Hello` frame carrying their peer id so the
//! acceptor knows who is on the other end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Frame, FrameCodec};
use crate::envelope::WireEnvelope;
use crate::error::TetherError;
use crate::transport::{Acceptor, Dialer, PeerId, Session, SessionEvent, SessionLink};

/// How long a dial may take before it is reported as an error.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an acceptor waits for the `Hello` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelopes queued per session while the socket is not draining. Sends
/// beyond this are dropped; reliable traffic is retransmitted anyway.
pub const OUTBOUND_CAPACITY: usize = 64;

// ── TcpDirectory ─────────────────────────────────────────────────

/// Maps peer ids to socket addresses.
#[derive(Debug, Clone, Default)]
pub struct TcpDirectory {
    entries: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
}

impl TcpDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, addr: SocketAddr) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(peer, addr);
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<SocketAddr> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(peer).copied()
    }
}

impl FromIterator<(PeerId, SocketAddr)> for TcpDirectory {
    fn from_iter<I: IntoIterator<Item = (PeerId, SocketAddr)>>(iter: I) -> Self {
        let directory = Self::new();
        for (peer, addr) in iter {
            directory.insert(peer, addr);
        }
        directory
    }
}

// ── TcpLink ──────────────────────────────────────────────────────

struct TcpLink {
    open: Arc<AtomicBool>,
    outbound: mpsc::Sender<WireEnvelope>,
    shutdown: CancellationToken,
}

impl SessionLink for TcpLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: WireEnvelope) -> Result<(), TetherError> {
        if !self.is_open() {
            return Err(TetherError::SessionClosed);
        }
        match self.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("tcp outbound queue full; dropping envelope");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TetherError::SessionClosed),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

/// Everything the background task needs besides the stream itself.
struct StreamTask {
    remote: PeerId,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::Receiver<WireEnvelope>,
    shutdown: CancellationToken,
}

fn session_parts(remote: PeerId) -> (Session, StreamTask) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let open = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    let session = Session::new(
        remote.clone(),
        TcpLink {
            open: open.clone(),
            outbound: outbound_tx,
            shutdown: shutdown.clone(),
        },
        events_rx,
    );
    let task = StreamTask {
        remote,
        open,
        events: events_tx,
        outbound: outbound_rx,
        shutdown,
    };
    (session, task)
}

impl StreamTask {
    fn fail(&self, error: TetherError) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Error(error));
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Open);
    }

    /// Pump frames until either side closes.
    async fn run(mut self, framed: Framed<TcpStream, FrameCodec>) {
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                outbound = self.outbound.recv() => match outbound {
                    Some(envelope) => {
                        // A peer that stops reading must not keep us from shutting down.
                        let written = tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            written = sink.send(Frame::Envelope(envelope)) => written,
                        };
                        if let Err(e) = written {
                            warn!(peer = %self.remote, "tcp write error: {e}");
                            self.fail(e);
                            return;
                        }
                    }
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Envelope(envelope))) => {
                        let _ = self.events.send(SessionEvent::Data(envelope));
                    }
                    Some(Ok(Frame::Hello { peer })) => {
                        debug!(peer = %self.remote, "ignoring repeated hello from {peer}");
                    }
                    Some(Err(e)) => {
                        warn!(peer = %self.remote, "tcp read error: {e}");
                        self.fail(e);
                        return;
                    }
                    None => break,
                },
            }
        }

        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Close);
        debug!(peer = %self.remote, "tcp session ended");
    }
}

// ── TcpDialer ────────────────────────────────────────────────────

/// Dials peers listed in a [`TcpDirectory`].
pub struct TcpDialer {
    local: PeerId,
    directory: TcpDirectory,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(local: PeerId, directory: TcpDirectory) -> Self {
        Self {
            local,
            directory,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Dialer for TcpDialer {
    /// Must be called from within a Tokio runtime.
    fn dial(&self, destination: &PeerId) -> Session {
        let Some(addr) = self.directory.lookup(destination) else {
            return Session::failed(
                destination.clone(),
                TetherError::PeerUnavailable(destination.to_string()),
            );
        };

        let (session, task) = session_parts(destination.clone());
        let local = self.local.clone();
        let timeout = self.connect_timeout;

        tokio::spawn(async move {
            let connect = tokio::select! {
                _ = task.shutdown.cancelled() => return,
                result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => result,
            };
            let stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(peer = %task.remote, "tcp connect to {addr} failed: {e}");
                    task.fail(e.into());
                    return;
                }
                Err(_) => {
                    task.fail(TetherError::Timeout(timeout));
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            let mut framed = Framed::new(stream, FrameCodec::new());
            if let Err(e) = framed.send(Frame::Hello { peer: local }).await {
                task.fail(e);
                return;
            }

            info!(peer = %task.remote, "tcp session open to {addr}");
            task.mark_open();
            task.run(framed).await;
        });

        session
    }
}

// ── TcpAcceptor ──────────────────────────────────────────────────

/// Accepts sessions dialed by [`TcpDialer`]s.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TetherError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Session, TetherError> {
        let (stream, addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, FrameCodec::new());

        let peer = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Frame::Hello { peer }))) => peer,
            Ok(Some(Ok(Frame::Envelope(_)))) => {
                return Err(TetherError::Handshake("expected hello frame"));
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(TetherError::Handshake("stream closed before hello")),
            Err(_) => return Err(TetherError::Timeout(HANDSHAKE_TIMEOUT)),
        };

        info!(%peer, "accepted tcp session from {addr}");
        let (session, task) = session_parts(peer);
        task.mark_open();
        tokio::spawn(task.run(framed));
        Ok(session)
    }
}
