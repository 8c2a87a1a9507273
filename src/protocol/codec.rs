//! Wire Codec
//!
//! Frame layout (all lengths little-endian):
//!
//! ```text
//! +--------------+-------------+----------------------------------+--------------+
//! | envelope_len | payload_len | envelope {type, origin, checksum} | payload JSON |
//! |     u32      |     u32     |               JSON               |              |
//! +--------------+-------------+----------------------------------+--------------+
//! ```
//!
//! The checksum is verified over the exact payload bytes before they are
//! parsed.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{payload_checksum, Message, MessageKind, NodeId};
use crate::error::{DecodeError, Error, Result};

/// Largest frame accepted (snapshots may be large)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Envelope length
    pub envelope_len: u32,
    /// Payload length
    pub payload_len: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.envelope_len.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [a, b, c, d, e, f, g, h] = *bytes;
        Self {
            envelope_len: u32::from_le_bytes([a, b, c, d]),
            payload_len: u32::from_le_bytes([e, f, g, h]),
        }
    }

    /// Total frame size including the header
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.envelope_len as usize + self.payload_len as usize
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    origin: NodeId,
    checksum: String,
}

/// Encode a message into a complete, self-delimiting frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let envelope = serde_json::to_vec(&Envelope {
        kind: message.kind(),
        origin: message.origin(),
        checksum: message.checksum().to_string(),
    })?;
    let payload = message.payload_bytes();

    if FrameHeader::SIZE + envelope.len() + payload.len() > MAX_FRAME_SIZE {
        return Err(Error::framing(format!(
            "{} payload of {} bytes exceeds frame limit",
            message.kind(),
            payload.len()
        )));
    }

    let header = FrameHeader {
        envelope_len: envelope.len() as u32,
        payload_len: payload.len() as u32,
    };

    let mut frame = Vec::with_capacity(header.frame_len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&envelope);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode exactly one complete frame
pub fn decode(frame: &[u8]) -> std::result::Result<Message, DecodeError> {
    let header = read_header(frame)?
        .ok_or_else(|| DecodeError::Framing(format!("incomplete header: {} bytes", frame.len())))?;

    let expected = header.frame_len();
    if frame.len() != expected {
        return Err(DecodeError::Framing(format!(
            "frame length {} does not match header ({} bytes)",
            frame.len(),
            expected
        )));
    }

    let envelope_end = FrameHeader::SIZE + header.envelope_len as usize;
    let envelope: Envelope = serde_json::from_slice(&frame[FrameHeader::SIZE..envelope_end])
        .map_err(|e| DecodeError::Framing(format!("malformed envelope: {}", e)))?;

    let payload_bytes = &frame[envelope_end..];
    let computed = payload_checksum(payload_bytes);
    if computed != envelope.checksum {
        return Err(DecodeError::ChecksumMismatch {
            carried: envelope.checksum,
            computed,
        });
    }

    let payload: serde_json::Value = serde_json::from_slice(payload_bytes)
        .map_err(|e| DecodeError::Framing(format!("malformed payload: {}", e)))?;

    Ok(Message::from_parts(envelope.kind, envelope.origin, payload, envelope.checksum))
}

/// Parse and bound-check the header, `None` if fewer than 8 bytes are present
fn read_header(buf: &[u8]) -> std::result::Result<Option<FrameHeader>, DecodeError> {
    let Some(bytes) = buf.get(..FrameHeader::SIZE) else {
        return Ok(None);
    };
    let mut raw = [0u8; FrameHeader::SIZE];
    raw.copy_from_slice(bytes);
    let header = FrameHeader::from_bytes(&raw);

    if header.envelope_len == 0 {
        return Err(DecodeError::Framing("empty envelope".into()));
    }
    if header.frame_len() > MAX_FRAME_SIZE {
        return Err(DecodeError::Framing(format!(
            "frame of {} bytes exceeds limit",
            header.frame_len()
        )));
    }
    Ok(Some(header))
}

/// Stream codec for [`tokio_util::codec::Framed`].
///
/// A frame with a bad checksum or unparseable envelope is yielded as
/// `Some(Err(..))` so the connection can drop that message and keep reading.
/// A header that cannot be trusted (oversized length) fails the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = std::result::Result<Message, DecodeError>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match read_header(&src[..])? {
            Some(header) => header,
            None => return Ok(None),
        };

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        Ok(Some(decode(&frame)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => {
                let remaining = src.remaining();
                src.clear();
                Err(Error::framing(format!("connection closed mid-frame ({} bytes buffered)", remaining)))
            }
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let frame = encode(item)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{QueryRequest, Replicate};

    fn sample() -> Message {
        Message::new(
            MessageKind::Replicate,
            2,
            &Replicate { sql: "INSERT INTO clientes (nome) VALUES ('ana')".into(), ack: false },
        )
        .unwrap()
    }

    #[test]
    fn test_frame_header() {
        let header = FrameHeader { envelope_len: 42, payload_len: 1000 };
        let restored = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(header, restored);
        assert_eq!(restored.frame_len(), 8 + 42 + 1000);
    }

    #[test]
    fn test_decode_returns_payload_unchanged() {
        let msg = sample();
        let decoded = decode(&encode(&msg).unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.payload(), msg.payload());
        assert_eq!(decoded.checksum(), msg.checksum());
    }

    #[test]
    fn test_payload_mutation_is_checksum_mismatch() {
        let frame = encode(&sample()).unwrap();
        let mut header = [0u8; FrameHeader::SIZE];
        header.copy_from_slice(&frame[..FrameHeader::SIZE]);
        let payload_start = FrameHeader::SIZE + FrameHeader::from_bytes(&header).envelope_len as usize;

        // Every single-byte change inside the payload must be caught
        for offset in payload_start..frame.len() {
            let mut tampered = frame.clone();
            tampered[offset] ^= 0x01;
            match decode(&tampered) {
                Err(DecodeError::ChecksumMismatch { .. }) => {}
                other => panic!("byte {} mutated, expected ChecksumMismatch, got {:?}", offset, other),
            }
        }
    }

    #[test]
    fn test_truncated_frame_is_framing_error() {
        let frame = encode(&sample()).unwrap();
        assert!(matches!(decode(&frame[..5]), Err(DecodeError::Framing(_))));
        assert!(matches!(decode(&frame[..frame.len() - 1]), Err(DecodeError::Framing(_))));

        let mut garbage = frame.clone();
        garbage[FrameHeader::SIZE] = b'#';
        assert!(matches!(decode(&garbage), Err(DecodeError::Framing(_))));
    }

    #[test]
    fn test_codec_splits_back_to_back_frames() {
        let first = sample();
        let second = Message::new(
            MessageKind::QueryRequest,
            0,
            &QueryRequest { sql: "SELECT * FROM clientes".into(), forwarded: false },
        )
        .unwrap();

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode(&first).unwrap());
        stream.extend_from_slice(&encode(&second).unwrap());

        let mut codec = MessageCodec;
        // Feed the stream in small chunks, as a socket might deliver it
        let mut pending = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(7) {
            pending.extend_from_slice(chunk);
            while let Some(item) = codec.decode(&mut pending).unwrap() {
                decoded.push(item.unwrap());
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_codec_skips_corrupt_frame() {
        let good = sample();
        let mut corrupt = encode(&good).unwrap();
        let last = corrupt.len() - 2;
        corrupt[last] ^= 0x20;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&encode(&good).unwrap());

        let mut codec = MessageCodec;
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(DecodeError::ChecksumMismatch { .. }))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ok(good)));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = FrameHeader { envelope_len: 10, payload_len: u32::MAX };
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        assert!(MessageCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_kind_survives_decoding() {
        let payload = serde_json::json!({ "hint": 1 });
        let body = crate::protocol::message::canonical_bytes(&payload);
        let envelope = serde_json::to_vec(&serde_json::json!({
            "type": "GOSSIP",
            "origin": 4,
            "checksum": payload_checksum(&body),
        }))
        .unwrap();

        let header = FrameHeader { envelope_len: envelope.len() as u32, payload_len: body.len() as u32 };
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(&envelope);
        frame.extend_from_slice(&body);

        let msg = decode(&frame).unwrap();
        assert_eq!(msg.kind(), MessageKind::Unknown);
        assert_eq!(msg.origin(), 4);
    }
}
