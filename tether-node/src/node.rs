//! Node service core logic.
//!
//! Listens for inbound TCP sessions, keeps one [`ReliableConnection`]
//! per peer, and relays input lines to every peer reliably.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_core::transport::Acceptor;
use tether_core::{
    ConnectionEvent, EventKind, Payload, PeerId, ReliableConnection, Session, TcpAcceptor,
    TcpDialer, TetherError,
};

use crate::config::NodeConfig;

type Connections = Arc<Mutex<BTreeMap<PeerId, ReliableConnection>>>;

// ── Node ─────────────────────────────────────────────────────────

/// A bound node, ready to [`run`](Node::run).
pub struct Node {
    config: NodeConfig,
    acceptor: TcpAcceptor,
    dialer: Arc<TcpDialer>,
    connections: Connections,
    inbox: Option<mpsc::UnboundedSender<(PeerId, Payload)>>,
    stop: Arc<Notify>,
}

impl Node {
    /// Bind the listen address from `config`.
    pub async fn bind(config: NodeConfig) -> Result<Self, TetherError> {
        let acceptor = TcpAcceptor::bind(config.node.listen).await?;
        let dialer = Arc::new(TcpDialer::new(config.node.id.clone(), config.directory()));
        info!(id = %config.node.id, "listening on {}", acceptor.local_addr()?);

        Ok(Self {
            config,
            acceptor,
            dialer,
            connections: Arc::default(),
            inbox: None,
            stop: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        self.acceptor.local_addr()
    }

    /// Obtain a handle that stops [`run`](Node::run) when notified.
    pub fn stop_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.stop)
    }

    /// Receive every payload delivered by any peer, alongside the log line.
    pub fn inbox(&mut self) -> mpsc::UnboundedReceiver<(PeerId, Payload)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbox = Some(tx);
        rx
    }

    /// Run until stopped.
    ///
    /// 1. Dials every configured peer.
    /// 2. Hands accepted sessions to the matching connection, creating
    ///    one for peers that dial in unannounced.
    /// 3. Sends each line read from `input` to every peer reliably.
    /// 4. Closes all connections when the stop handle is notified.
    pub async fn run<R>(self, input: R) -> Result<(), TetherError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Self {
            config,
            acceptor,
            dialer,
            connections,
            inbox,
            stop,
        } = self;
        let router = Router {
            dialer,
            connections,
            inbox,
            config,
        };

        for peer in router.config.peers.keys() {
            router.connect(peer.clone());
        }

        let (session_tx, mut sessions) = mpsc::unbounded_channel();
        let accept_task = spawn_accept_loop(acceptor, session_tx);
        let mut lines = Some(input.lines());

        loop {
            tokio::select! {
                () = stop.notified() => break,
                Some(session) = sessions.recv() => router.route(session),
                line = next_line(&mut lines) => match line {
                    Ok(Some(line)) => router.broadcast(&line),
                    Ok(None) => {
                        debug!("input closed");
                        lines = None;
                    }
                    Err(e) => {
                        warn!("input error: {e}");
                        lines = None;
                    }
                },
            }
        }

        accept_task.abort();
        router.close_all();
        info!("node stopped");
        Ok(())
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn spawn_accept_loop(
    mut acceptor: TcpAcceptor,
    sessions: mpsc::UnboundedSender<Session>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match acceptor.accept().await {
                Ok(session) => {
                    if sessions.send(session).is_err() {
                        return;
                    }
                }
                Err(TetherError::Io(e)) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => warn!("rejected inbound session: {e}"),
            }
        }
    })
}

// ── Routing ──────────────────────────────────────────────────────

struct Router {
    config: NodeConfig,
    dialer: Arc<TcpDialer>,
    connections: Connections,
    inbox: Option<mpsc::UnboundedSender<(PeerId, Payload)>>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<PeerId, ReliableConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connect(&self, peer: PeerId) {
        info!(%peer, "dialing configured peer");
        let conn =
            ReliableConnection::dial(self.dialer.clone(), peer.clone(), self.config.connection.clone());
        self.attach(&conn);
        self.lock().insert(peer, conn);
    }

    fn route(&self, session: Session) {
        let peer = session.remote().clone();
        let existing = self.lock().get(&peer).cloned();
        match existing {
            Some(conn) => {
                debug!(%peer, session = session.id(), "handing inbound session to connection");
                if conn.accept_inbound_session(session).is_err() {
                    warn!(%peer, "connection task gone; dropping inbound session");
                }
            }
            None => {
                info!(%peer, "new peer dialed in");
                let conn = ReliableConnection::from_session(
                    self.dialer.clone(),
                    session,
                    self.config.connection.clone(),
                );
                self.attach(&conn);
                self.lock().insert(peer, conn);
            }
        }
    }

    fn attach(&self, conn: &ReliableConnection) {
        let peer = conn.destination().clone();
        let inbox = self.inbox.clone();
        conn.on(EventKind::Data, {
            let peer = peer.clone();
            move |event| {
                if let ConnectionEvent::Data(payload) = event {
                    info!(%peer, "received {payload}");
                    if let Some(inbox) = &inbox {
                        let _ = inbox.send((peer.clone(), payload.clone()));
                    }
                }
            }
        })
        .on(EventKind::Change, {
            let peer = peer.clone();
            move |event| {
                if let ConnectionEvent::Change(open) = event {
                    info!(%peer, open, "connection changed");
                }
            }
        })
        .on(EventKind::Exhausted, move |event| {
            if let ConnectionEvent::Exhausted { attempts } = event {
                warn!(%peer, attempts, "giving up on peer until it dials in");
            }
        });
    }

    fn broadcast(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let payload = serde_json::json!(line);
        for (peer, conn) in self.lock().iter() {
            if let Err(e) = conn.send_reliable(payload.clone()) {
                warn!(%peer, "send failed: {e}");
            }
        }
    }

    fn close_all(&self) {
        for conn in std::mem::take(&mut *self.lock()).into_values() {
            conn.close();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
