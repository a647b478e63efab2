//! # tether-core
//!
//! Reliable, self-healing connections between two peers over a session
//! transport that may silently drop.
//!
//! This crate contains:
//! - **Connection**: `ReliableConnection`, the per-peer state machine that
//!   reconnects, retransmits, and fans events out to listeners
//! - **Envelope**: the `{ reliable, fingerprint?, payload? }` wire shape
//! - **Fingerprint**: identifiers matching acknowledgements to messages
//! - **Transport**: the `Dialer` / `Acceptor` / `Session` seam, with
//!   in-memory and TCP implementations
//! - **Codec**: `FrameCodec` for framed stream I/O via `tokio_util`
//! - **Error**: `TetherError`, a typed, `thiserror`-based error hierarchy

pub mod codec;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use connection::{
    BackoffPolicy, ConnectionConfig, ConnectionEvent, ConnectionStatus, EventKind, ListenerId,
    ReconnectPhase, ReliableConnection,
};
pub use envelope::{Envelope, Payload, WireEnvelope};
pub use error::{ProtocolError, TetherError};
pub use fingerprint::{Fingerprint, FingerprintSource};
pub use transport::{
    Acceptor, Dialer, MemoryDialer, MemoryEndpoint, MemoryNetwork, PeerId, Session, SessionEvent,
    SessionLink, TcpAcceptor, TcpDialer, TcpDirectory,
};
