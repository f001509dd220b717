//! Length-prefixed JSON framing for the control channel

use crate::messages::TunnelMessage;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
///
/// Any of these is fatal for the channel; a frame that parses as JSON but is
/// not a known message is reported as [`Frame::Malformed`] instead.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(TunnelMessage),
    /// The frame was complete but did not contain a valid message
    Malformed(String),
}

/// Tunnel message codec
///
/// Format: `[length: u32 BE][payload: JSON message]`
#[derive(Debug, Clone)]
pub struct TunnelCodec {
    max_frame_bytes: usize,
}

impl TunnelCodec {
    /// Default maximum frame size (16MB)
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self::new(Self::MAX_FRAME_BYTES)
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_bytes {
            return Err(CodecError::MessageTooLarge {
                size: length,
                limit: self.max_frame_bytes,
            });
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);

        match serde_json::from_slice::<TunnelMessage>(&payload) {
            Ok(msg) => Ok(Some(Frame::Message(msg))),
            Err(e) => Ok(Some(Frame::Malformed(e.to_string()))),
        }
    }
}

impl Encoder<TunnelMessage> for TunnelCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: TunnelMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&msg)?;

        if payload.len() > self.max_frame_bytes {
            return Err(CodecError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_frame_bytes,
            });
        }

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HttpResponsePayload, Headers};

    fn encoded(msg: TunnelMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        TunnelCodec::default().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = TunnelCodec::default();
        let frame = encoded(TunnelMessage::Pong {
            timestamp: Some(67890),
        });

        let mut buf = BytesMut::from(&frame[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[6..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(TunnelMessage::Pong {
                timestamp: Some(67890)
            }))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = TunnelCodec::default();
        let mut buf = encoded(TunnelMessage::Ping { timestamp: None });
        buf.extend_from_slice(&encoded(TunnelMessage::Response {
            request_id: "r1".to_string(),
            payload: HttpResponsePayload {
                status_code: 204,
                headers: Headers::new(),
                body: None,
            },
        }));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Frame::Message(TunnelMessage::Ping { timestamp: None }));
        assert!(matches!(
            second,
            Frame::Message(TunnelMessage::Response { ref request_id, .. }) if request_id == "r1"
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_malformed_payload_keeps_stream_usable() {
        let mut codec = TunnelCodec::default();
        let junk = br#"{"type":"NOPE"}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(junk.len() as u32);
        buf.extend_from_slice(junk);
        buf.extend_from_slice(&encoded(TunnelMessage::Ping { timestamp: Some(1) }));

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Malformed(_))
        ));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(TunnelMessage::Ping { timestamp: Some(1) }))
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = TunnelCodec::new(32);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::MessageTooLarge {
                size: 1024,
                limit: 32
            }
        ));

        let mut out = BytesMut::new();
        let err = codec
            .encode(TunnelMessage::error("CHANNEL_ERROR", "x".repeat(64)), &mut out)
            .unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { limit: 32, .. }));
    }
}
