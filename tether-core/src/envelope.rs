//! Envelopes carried over a transport session.
//!
//! Three shapes share one wire form `{ reliable, fingerprint?, payload? }`:
//!
//! | reliable | fingerprint | payload | meaning        |
//! |----------|-------------|---------|----------------|
//! | `true`   | present     | present | reliable data  |
//! | `true`   | present     | absent  | acknowledgement|
//! | `false`  | absent      | present | plain data     |
//!
//! A JSON `null` payload counts as present. Anything else is a
//! [`ProtocolError`].

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::fingerprint::Fingerprint;

/// Application payload. Opaque to the connection layer.
pub type Payload = serde_json::Value;

// ── WireEnvelope ─────────────────────────────────────────────────

/// The unvalidated envelope exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub reliable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub payload: Option<Payload>,
}

/// Keeps an explicit `null` payload distinct from a missing one.
fn present<'de, D>(deserializer: D) -> Result<Option<Payload>, D::Error>
where
    D: Deserializer<'de>,
{
    Payload::deserialize(deserializer).map(Some)
}

// ── Envelope ─────────────────────────────────────────────────────

/// A validated envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A reliable message awaiting acknowledgement.
    Data {
        fingerprint: Fingerprint,
        payload: Payload,
    },
    /// Acknowledges the reliable message with this fingerprint.
    Ack { fingerprint: Fingerprint },
    /// Fire-and-forget message.
    Plain { payload: Payload },
}

impl Envelope {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Plain { .. })
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            Self::Data { fingerprint, .. } | Self::Ack { fingerprint } => Some(*fingerprint),
            Self::Plain { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Data { payload, .. } | Self::Plain { payload } => Some(payload),
            Self::Ack { .. } => None,
        }
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Data {
                fingerprint,
                payload,
            } => Self {
                reliable: true,
                fingerprint: Some(fingerprint),
                payload: Some(payload),
            },
            Envelope::Ack { fingerprint } => Self {
                reliable: true,
                fingerprint: Some(fingerprint),
                payload: None,
            },
            Envelope::Plain { payload } => Self {
                reliable: false,
                fingerprint: None,
                payload: Some(payload),
            },
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        match (wire.reliable, wire.fingerprint, wire.payload) {
            (true, None, _) => Err(ProtocolError::MissingFingerprint),
            (true, Some(fingerprint), Some(payload)) => Ok(Self::Data {
                fingerprint,
                payload,
            }),
            (true, Some(fingerprint), None) => Ok(Self::Ack { fingerprint }),
            (false, Some(_), _) => Err(ProtocolError::UnexpectedFingerprint),
            (false, None, None) => Err(ProtocolError::MissingPayload),
            (false, None, Some(payload)) => Ok(Self::Plain { payload }),
        }
    }
}
