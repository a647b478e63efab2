//! Framing for stream transports.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON-encoded
//! [`Frame`]. The first frame a dialer writes is always a `Hello`.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::envelope::WireEnvelope;
use crate::error::TetherError;
use crate::transport::PeerId;

/// Largest frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A unit on a stream transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// Identifies the dialing peer.
    Hello { peer: PeerId },
    Envelope(WireEnvelope),
}

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(TetherError::FrameTooLarge {
                size: json.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::fingerprint::Fingerprint;
    use serde_json::json;

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::Envelope(
            Envelope::Data {
                fingerprint: Fingerprint::from_raw(9),
                payload: json!({ "text": "hello" }),
            }
            .into(),
        );
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
        assert!(partial.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Hello {
                    peer: PeerId::from("alice"),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Frame::Envelope(Envelope::Plain { payload: json!(1) }.into()),
                &mut buf,
            )
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Hello { .. })
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Envelope(_))
        ));
    }

    #[test]
    fn rejects_garbage_json() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"nope");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TetherError::Encoding(_))
        ));
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(TetherError::Io(_))));
    }
}
