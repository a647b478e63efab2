//! Domain-specific error types for tether connections.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Malformed envelopes are reported as [`ProtocolError`] and never panic.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the tether connection layer.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A received envelope did not have a valid shape.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A frame exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The first frame on an inbound stream was not a hello.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport could not reach the destination peer.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// The session is not open, so nothing can be sent on it.
    #[error("session closed")]
    SessionClosed,

    /// A dial did not complete in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Connection Errors ────────────────────────────────────────
    /// The connection task has stopped; the handle is no longer usable.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a frame failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ── ProtocolError ─────────────────────────────────────────────────

/// Ways an envelope on the wire can violate the reliable protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// `reliable: true` without a fingerprint.
    #[error("reliable envelope is missing its fingerprint")]
    MissingFingerprint,

    /// `reliable: false` without a payload.
    #[error("plain envelope is missing its payload")]
    MissingPayload,

    /// `reliable: false` carrying a fingerprint.
    #[error("plain envelope must not carry a fingerprint")]
    UnexpectedFingerprint,
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TetherError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TetherError::ChannelClosed
    }
}
