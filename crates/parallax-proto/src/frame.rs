//! Frame encoding and incremental decoding.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::message::PeerMessage;

/// Frame header size in bytes (big-endian u16 payload length).
pub const FRAME_HEADER_SIZE: usize = 2;

/// Maximum payload size representable by the length prefix.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Encodes a message into a complete frame (length prefix + payload).
pub fn encode_frame(message: &PeerMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Serialisation(e.to_string()))?;

    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// The underlying socket may deliver partial frames or several frames per
/// read; the decoder buffers across arbitrary byte boundaries and yields a
/// complete message whenever one is available. A payload that fails to
/// decode is an error the connection owner must treat as fatal.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends received bytes to the reassembly buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extracts the next complete message, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<PeerMessage>, ProtocolError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = usize::from(u16::from_be_bytes([self.buffer[0], self.buffer[1]]));
        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(len);

        let message = serde_json::from_slice(&payload)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))?;
        Ok(Some(message))
    }

    /// Number of buffered, not-yet-consumed bytes.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_message() -> PeerMessage {
        PeerMessage::request("ping", 7, Some("w1".into()), json!({"n": 1}))
    }

    #[test]
    fn roundtrip_single_frame() {
        let message = sample_message();
        let frame = encode_frame(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);

        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn reassembles_across_arbitrary_boundaries() {
        let message = sample_message();
        let frame = encode_frame(&message).unwrap();

        // Feed one byte at a time, including a split inside the header.
        let mut decoder = FrameDecoder::new();
        for (i, byte) in frame.iter().enumerate() {
            decoder.push(std::slice::from_ref(byte));
            let result = decoder.next_message().unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none(), "yielded early at byte {i}");
            } else {
                assert_eq!(result, Some(message.clone()));
            }
        }
    }

    #[test]
    fn multiple_frames_per_push() {
        let first = sample_message();
        let second = PeerMessage::tell("notify", Some("w2".into()), json!(["a", "b"]));

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend_from_slice(&encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        assert_eq!(decoder.next_message().unwrap(), Some(first));
        assert_eq!(decoder.next_message().unwrap(), Some(second));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn oversize_payload_rejected() {
        let big = "x".repeat(MAX_FRAME_PAYLOAD);
        let message = PeerMessage::tell("blob", None, json!(big));
        let result = encode_frame(&message);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 3, b'z', b'z', b'z']);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::Deserialisation(_))
        ));
    }
}
