//! The per-connection task.
//!
//! All connection state lives here and is touched only from [`run`],
//! which multiplexes the command inbox, the current session's events,
//! the retransmit deadline and the reconnect deadline.
//!
//! [`run`]: ConnectionActor::run

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::ConnectionConfig;
use super::listeners::{ConnectionEvent, EventKind, Listener, ListenerId, ListenerRegistry};
use super::reconnect::{ReconnectController, Step};
use super::timer::Deadline;
use super::ConnectionStatus;
use crate::envelope::{Envelope, Payload, WireEnvelope};
use crate::error::TetherError;
use crate::fingerprint::{Fingerprint, FingerprintSource};
use crate::transport::{Dialer, PeerId, Session, SessionEvent};

/// Requests from [`ReliableConnection`](super::ReliableConnection) handles.
pub(crate) enum Command {
    Send(Payload),
    SendReliable(Option<Payload>),
    Subscribe {
        id: ListenerId,
        kind: EventKind,
        listener: Listener,
    },
    Unsubscribe(ListenerId),
    SetPeerPresence(bool),
    AcceptInbound(Session),
    Reconnect,
    Close,
}

/// The reliable message currently awaiting acknowledgement.
#[derive(Debug)]
struct InFlight {
    fingerprint: Fingerprint,
    payload: Payload,
}

pub(crate) struct ConnectionActor {
    destination: PeerId,
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    session: Session,
    is_open: bool,
    peer_has_presence: bool,
    outbound: VecDeque<Payload>,
    in_flight: Option<InFlight>,
    /// Armed exactly while `in_flight` is set.
    retransmit: Deadline,
    /// Last reliable fingerprint handed to data listeners.
    last_delivered: Option<Fingerprint>,
    reconnect: ReconnectController,
    fingerprints: FingerprintSource,
    listeners: ListenerRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionActor {
    pub(crate) fn new(
        destination: PeerId,
        dialer: Arc<dyn Dialer>,
        session: Session,
        config: ConnectionConfig,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, watch::Receiver<ConnectionStatus>) {
        let reconnect = ReconnectController::new(config.retry_limit, config.backoff.clone());
        let is_open = session.is_open();
        let initial = ConnectionStatus {
            is_open,
            peer_has_presence: true,
            reconnect: reconnect.phase(),
            queued: 0,
            in_flight: None,
        };
        let (status, status_rx) = watch::channel(initial);

        let actor = Self {
            destination,
            dialer,
            config,
            session,
            is_open,
            peer_has_presence: true,
            outbound: VecDeque::new(),
            in_flight: None,
            retransmit: Deadline::default(),
            last_delivered: None,
            reconnect,
            fingerprints: FingerprintSource::new(),
            listeners: ListenerRegistry::default(),
            commands,
            status,
        };
        (actor, status_rx)
    }

    pub(crate) async fn run(mut self) {
        info!(peer = %self.destination, session = self.session.id(), "connection started");

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.session.next_event() => match event {
                    Some(event) => self.handle_session_event(event),
                    None => debug!(peer = %self.destination, "session event stream ended"),
                },
                () = self.retransmit.elapsed() => self.retransmit_tick(),
                () = self.reconnect.elapsed() => self.reconnect_step(),
            }
            self.publish();
        }

        self.session.close();
        self.set_open(false);
        self.publish();
        info!(peer = %self.destination, "connection stopped");
    }

    fn publish(&self) {
        let next = ConnectionStatus {
            is_open: self.is_open,
            peer_has_presence: self.peer_has_presence,
            reconnect: self.reconnect.phase(),
            queued: self.outbound.len(),
            in_flight: self.in_flight.as_ref().map(|m| m.fingerprint),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // ── Commands ─────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(payload) => self.transmit(Envelope::Plain { payload }),
            Command::SendReliable(payload) => self.send_reliable(payload),
            Command::Subscribe { id, kind, listener } => self.listeners.add(id, kind, listener),
            Command::Unsubscribe(id) => {
                if !self.listeners.remove(id) {
                    debug!(
                        peer = %self.destination,
                        listener = id.0,
                        "unsubscribe of unknown listener"
                    );
                }
            }
            Command::SetPeerPresence(present) => self.set_peer_presence(present),
            Command::AcceptInbound(session) => self.accept_inbound(session),
            Command::Reconnect => self.restart_reconnect("requested"),
            Command::Close => {}
        }
    }

    fn set_peer_presence(&mut self, present: bool) {
        if !present {
            self.set_open(false);
        }
        if !self.peer_has_presence && present {
            self.restart_reconnect("peer presence restored");
        }
        self.peer_has_presence = present;
    }

    fn accept_inbound(&mut self, session: Session) {
        info!(
            peer = %self.destination,
            old = self.session.id(),
            new = session.id(),
            "adopting inbound session"
        );
        self.reconnect.cancel();
        self.replace_session(session);
    }

    // ── Status ───────────────────────────────────────────────────

    /// Listeners run before the new value is stored.
    fn set_open(&mut self, open: bool) {
        if self.is_open == open {
            return;
        }
        self.listeners.emit(&ConnectionEvent::Change(open));
        self.is_open = open;
        if open {
            self.reconnect.settle();
        }
        info!(peer = %self.destination, open, "connection status changed");
    }

    // ── Session ──────────────────────────────────────────────────

    fn replace_session(&mut self, session: Session) {
        let old = std::mem::replace(&mut self.session, session);
        old.close();
    }

    fn transmit(&self, envelope: Envelope) {
        if let Err(e) = self.session.send(envelope) {
            debug!(peer = %self.destination, "send dropped: {e}");
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open => {
                self.set_open(true);
                self.listeners.emit(&ConnectionEvent::Open);
            }
            SessionEvent::Data(wire) => {
                self.set_open(true);
                self.handle_data(wire);
            }
            SessionEvent::Close => {
                self.set_open(false);
                self.listeners.emit(&ConnectionEvent::Close);
            }
            SessionEvent::Error(e) => {
                warn!(peer = %self.destination, "transport error: {e}");
                self.listeners.emit(&ConnectionEvent::Error(e));
                self.set_open(false);
                self.trigger_reconnect("transport error");
            }
        }
    }

    fn handle_data(&mut self, wire: WireEnvelope) {
        let envelope = match Envelope::try_from(wire) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %self.destination, "dropping malformed envelope: {e}");
                self.listeners.emit(&ConnectionEvent::Error(TetherError::Protocol(e)));
                return;
            }
        };

        match envelope {
            Envelope::Ack { fingerprint } => self.handle_ack(fingerprint),
            Envelope::Data {
                fingerprint,
                payload,
            } => {
                self.transmit(Envelope::Ack { fingerprint });
                if self.last_delivered == Some(fingerprint) {
                    debug!(peer = %self.destination, %fingerprint, "duplicate reliable message");
                    return;
                }
                self.last_delivered = Some(fingerprint);
                self.listeners.emit(&ConnectionEvent::Data(payload));
            }
            Envelope::Plain { payload } => {
                self.listeners.emit(&ConnectionEvent::Data(payload));
            }
        }
    }

    // ── Reliable delivery ────────────────────────────────────────

    fn send_reliable(&mut self, payload: Option<Payload>) {
        if let Some(payload) = payload {
            self.outbound.push_back(payload);
        }
        self.advance_queue();
    }

    fn advance_queue(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(payload) = self.outbound.pop_front() else {
            return;
        };
        let fingerprint = self.fingerprints.next_fingerprint();
        debug!(peer = %self.destination, %fingerprint, queued = self.outbound.len(), "reliable send");
        self.in_flight = Some(InFlight {
            fingerprint,
            payload,
        });
        self.retransmit_tick();
    }

    fn handle_ack(&mut self, fingerprint: Fingerprint) {
        match &self.in_flight {
            Some(message) if message.fingerprint == fingerprint => {}
            _ => {
                debug!(peer = %self.destination, %fingerprint, "ignoring stale ack");
                return;
            }
        }
        self.retransmit.cancel();
        self.in_flight = None;
        debug!(peer = %self.destination, %fingerprint, "reliable message acknowledged");
        self.advance_queue();
    }

    /// Transmit the in-flight message, or reconnect if the transport is
    /// down, then schedule the next tick.
    fn retransmit_tick(&mut self) {
        let envelope = match &self.in_flight {
            Some(message) => Envelope::Data {
                fingerprint: message.fingerprint,
                payload: message.payload.clone(),
            },
            None => {
                self.retransmit.cancel();
                return;
            }
        };

        if self.session.is_open() {
            self.transmit(envelope);
        } else {
            self.trigger_reconnect("reliable send on closed transport");
        }
        self.retransmit.arm(self.config.retransmit_interval());
    }

    // ── Reconnection ─────────────────────────────────────────────

    fn trigger_reconnect(&mut self, reason: &'static str) {
        if self.is_open {
            return;
        }
        if self.reconnect.begin() {
            info!(peer = %self.destination, reason, "starting reconnection");
            self.reconnect_step();
        }
    }

    fn restart_reconnect(&mut self, reason: &'static str) {
        if self.reconnect.restart() {
            info!(peer = %self.destination, reason, "starting reconnection");
            self.reconnect_step();
        }
    }

    fn reconnect_step(&mut self) {
        if self.is_open {
            self.reconnect.settle();
            return;
        }

        match self.reconnect.advance() {
            Step::Dial { attempt } => {
                info!(
                    peer = %self.destination,
                    attempt,
                    limit = self.reconnect.limit(),
                    "dialing"
                );
                let session = self.dialer.dial(&self.destination);
                self.replace_session(session);
            }
            Step::Exhausted { attempts } => {
                warn!(peer = %self.destination, attempts, "reconnection attempts exhausted");
                self.listeners.emit(&ConnectionEvent::Exhausted { attempts });
            }
            Step::Idle => {}
        }
    }
}
