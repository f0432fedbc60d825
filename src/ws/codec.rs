//! # Frame Codec
//!
//! Wire-level framing for the message-oriented sockets under test. Client
//! frames are always masked (as a browser would send them), server frames
//! are normally unmasked; `decode` accepts both.
//!
//! The codec also owns batch construction: at high target rates the open-loop
//! generator does not send one frame per write, it sends one pre-built buffer
//! holding many copies of the same frame. See [`build_batch`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Mask key used by [`encode`]. Any key is valid on the wire; a fixed one
/// keeps encoding a pure function of its inputs.
pub const DEFAULT_MASK: [u8; 4] = [0x5a, 0x1e, 0xc3, 0x97];

/// Largest payload `decode` and the message reader will accept.
pub const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Errors produced while encoding, decoding or batching frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("unsupported opcode 0x{0:x}")]
    UnsupportedOpcode(u8),

    #[error("frame payload of {0} bytes exceeds the 64 MiB limit")]
    PayloadTooLarge(u64),

    #[error(
        "cannot batch a {frame_len} byte frame at {rate} msg/s within {max_bytes} bytes"
    )]
    BatchUnsatisfiable {
        rate: u32,
        frame_len: usize,
        max_bytes: usize,
    },
}

/// Data message types carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Binary => write!(f, "binary"),
        }
    }
}

/// Frame opcodes understood by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(CodecError::UnsupportedOpcode(other)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Data opcodes map onto a message kind; control opcodes do not.
    pub fn message_kind(self) -> Option<MessageKind> {
        match self {
            Opcode::Text => Some(MessageKind::Text),
            Opcode::Binary => Some(MessageKind::Binary),
            _ => None,
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Total header length in bytes, including the first two.
    pub header_len: usize,
}

impl FrameHeader {
    /// Number of header bytes that follow the first two, derived from the
    /// second header byte alone.
    pub fn extra_len(second: u8) -> usize {
        let length_bytes = match second & 0x7f {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if second & 0x80 != 0 {
            length_bytes + 4
        } else {
            length_bytes
        }
    }

    /// Parse a header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::Incomplete);
        }
        let header_len = 2 + Self::extra_len(buf[1]);
        if buf.len() < header_len {
            return Err(CodecError::Incomplete);
        }

        let fin = buf[0] & 0x80 != 0;
        let opcode = Opcode::from_u8(buf[0] & 0x0f)?;
        let masked = buf[1] & 0x80 != 0;

        let mut offset = 2;
        let payload_len = match buf[1] & 0x7f {
            126 => {
                offset += 2;
                u16::from_be_bytes([buf[2], buf[3]]) as u64
            }
            127 => {
                offset += 8;
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(len)
            }
            short => short as u64,
        };
        if payload_len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[offset..offset + 4]);
            Some(key)
        } else {
            None
        };

        Ok(Self {
            fin,
            opcode,
            mask,
            payload_len,
            header_len,
        })
    }
}

/// XOR `buf` in place with the repeating 4-byte mask key.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// An encoded message ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: MessageKind,
    payload_len: usize,
    bytes: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length on the wire
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode a single unfragmented client frame with the default mask key.
pub fn encode(kind: MessageKind, payload: &[u8]) -> Frame {
    encode_with_mask(kind, payload, Some(DEFAULT_MASK))
}

/// Encode a single unfragmented frame. `None` produces an unmasked
/// (server-to-client) frame.
pub fn encode_with_mask(kind: MessageKind, payload: &[u8], mask: Option<[u8; 4]>) -> Frame {
    let len = payload.len();
    let mut bytes = Vec::with_capacity(len + 14);
    bytes.push(0x80 | kind.opcode().as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        bytes.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        bytes.push(mask_bit | 126);
        bytes.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        bytes.push(mask_bit | 127);
        bytes.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            bytes.extend_from_slice(&key);
            let start = bytes.len();
            bytes.extend_from_slice(payload);
            apply_mask(&mut bytes[start..], key);
        }
        None => bytes.extend_from_slice(payload),
    }

    Frame {
        kind,
        payload_len: len,
        bytes,
    }
}

/// A frame decoded from a byte buffer, payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Decode one frame from the front of `buf`, returning it together with the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(DecodedFrame, usize), CodecError> {
    let header = FrameHeader::parse(buf)?;
    let end = header.header_len + header.payload_len as usize;
    if buf.len() < end {
        return Err(CodecError::Incomplete);
    }

    let mut payload = buf[header.header_len..end].to_vec();
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        DecodedFrame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        },
        end,
    ))
}

/// Immutable transmit buffer holding `count` copies of one frame
#[derive(Debug, Clone)]
pub struct Batch {
    bytes: Arc<[u8]>,
    count: usize,
    tick_rate: u32,
    payload_len: usize,
}

impl Batch {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of frames in the buffer
    pub fn count(&self) -> usize {
        self.count
    }

    /// Emissions per second needed to reach the target rate
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Payload bytes carried by one batch, framing excluded
    pub fn payload_bytes(&self) -> u64 {
        (self.count * self.payload_len) as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pack copies of `frame` into one buffer so that `count * tick_rate`
/// approximates `rate` messages per second.
///
/// Larger batches are preferred up to `max_bytes`; the tick rate then covers
/// the residual. Once the tick rate is known the count is recomputed downward
/// so the overshoot is at most `tick_rate - 1` messages per second.
pub fn build_batch(frame: &Frame, rate: u32, max_bytes: usize) -> Result<Batch, CodecError> {
    let unsatisfiable = CodecError::BatchUnsatisfiable {
        rate,
        frame_len: frame.len(),
        max_bytes,
    };
    if rate == 0 || frame.is_empty() {
        return Err(unsatisfiable);
    }

    let rate = rate as usize;
    let fit = max_bytes / frame.len();
    let initial = rate.min(fit);
    if initial == 0 {
        return Err(unsatisfiable);
    }

    let tick_rate = (rate + initial - 1) / initial;
    let count = (rate + tick_rate - 1) / tick_rate;

    let mut bytes = Vec::with_capacity(count * frame.len());
    for _ in 0..count {
        bytes.extend_from_slice(frame.as_bytes());
    }
    if bytes.is_empty() || bytes.len() > max_bytes || tick_rate == 0 {
        return Err(unsatisfiable);
    }

    Ok(Batch {
        bytes: bytes.into(),
        count,
        tick_rate: tick_rate as u32,
        payload_len: frame.payload_len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_across_length_forms() {
        for size in [1usize, 16, 125, 126, 1024, 65535, 65536, 70_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let frame = encode(MessageKind::Binary, &payload);

            let (decoded, consumed) = decode(frame.as_bytes()).unwrap();
            assert_eq!(consumed, frame.len(), "size {}", size);
            assert!(decoded.fin);
            assert_eq!(decoded.opcode, Opcode::Binary);
            assert_eq!(decoded.payload, payload, "size {}", size);
        }
    }

    #[test]
    fn test_encode_is_masked_and_deterministic() {
        let payload = b"hello";
        let a = encode(MessageKind::Text, payload);
        let b = encode(MessageKind::Text, payload);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes()[0], 0x81);
        assert_eq!(a.as_bytes()[1], 0x80 | 5);
        assert_eq!(&a.as_bytes()[2..6], &DEFAULT_MASK);
        assert_ne!(&a.as_bytes()[6..], payload);
        assert_eq!(a.payload_len(), 5);
        assert_eq!(a.kind(), MessageKind::Text);
    }

    #[test]
    fn test_unmasked_frame_layout() {
        let frame = encode_with_mask(MessageKind::Binary, &[1, 2, 3], None);
        assert_eq!(frame.as_bytes(), &[0x82, 3, 1, 2, 3]);
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = encode(MessageKind::Binary, &[7u8; 300]);
        assert_eq!(decode(&frame.as_bytes()[..1]), Err(CodecError::Incomplete));
        assert_eq!(decode(&frame.as_bytes()[..3]), Err(CodecError::Incomplete));
        assert_eq!(
            decode(&frame.as_bytes()[..frame.len() - 1]),
            Err(CodecError::Incomplete)
        );
    }

    #[test]
    fn test_decode_rejects_reserved_opcode() {
        assert_eq!(
            decode(&[0x83, 0x00]),
            Err(CodecError::UnsupportedOpcode(0x3))
        );
    }

    #[test]
    fn test_decode_consumes_one_frame_of_a_batch() {
        let frame = encode(MessageKind::Binary, b"abc");
        let batch = build_batch(&frame, 3, 1024).unwrap();
        let (first, consumed) = decode(batch.bytes()).unwrap();
        assert_eq!(first.payload, b"abc");
        assert_eq!(consumed, frame.len());
        let (second, _) = decode(&batch.bytes()[consumed..]).unwrap();
        assert_eq!(second.payload, b"abc");
    }

    #[test]
    fn test_build_batch_prefers_one_big_send() {
        // 16 byte payload -> 22 byte client frame
        let frame = encode(MessageKind::Binary, &[0u8; 16]);
        assert_eq!(frame.len(), 22);

        let batch = build_batch(&frame, 100, 8 * 1024).unwrap();
        assert_eq!(batch.count(), 100);
        assert_eq!(batch.tick_rate(), 1);
        assert_eq!(batch.len(), 2200);
        // payload only, no header or mask key
        assert_eq!(batch.payload_bytes(), 1600);
    }

    #[test]
    fn test_build_batch_raises_tick_rate_past_byte_ceiling() {
        let frame = encode(MessageKind::Binary, &[0u8; 16]);
        let batch = build_batch(&frame, 1000, 8 * 1024).unwrap();
        // 372 frames fit; 3 ticks/s then needs 334 frames per tick
        assert_eq!(batch.tick_rate(), 3);
        assert_eq!(batch.count(), 334);
        assert!(batch.len() <= 8 * 1024);
    }

    #[test]
    fn test_build_batch_invariants_over_rates() {
        let frame = encode(MessageKind::Binary, &[0u8; 1024]);
        for rate in (1..=20_000u32).step_by(97) {
            let batch = build_batch(&frame, rate, 8 * 1024).unwrap();
            assert!(batch.count() >= 1);
            assert!(batch.tick_rate() >= 1);
            assert!(batch.len() <= 8 * 1024);
            let effective = batch.count() * batch.tick_rate() as usize;
            assert!(effective >= rate as usize);
            assert!(effective < rate as usize + batch.tick_rate() as usize);
        }
    }

    #[test]
    fn test_build_batch_unsatisfiable() {
        let frame = encode(MessageKind::Binary, &[0u8; 16]);
        assert!(matches!(
            build_batch(&frame, 0, 8 * 1024),
            Err(CodecError::BatchUnsatisfiable { rate: 0, .. })
        ));

        let big = encode(MessageKind::Binary, &[0u8; 9000]);
        assert!(matches!(
            build_batch(&big, 10, 8 * 1024),
            Err(CodecError::BatchUnsatisfiable { .. })
        ));
    }
}
