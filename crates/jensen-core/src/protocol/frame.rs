//! Outer frame codec.
//!
//! Every exchange is framed the same way in both directions:
//! magic(2) + command id (u16) + sequence (u32) + body length (u32) + body,
//! big-endian throughout. Bulk reads can return a frame in arbitrary pieces,
//! so decoding is done by an accumulating [`FrameDecoder`] that yields zero
//! or one complete frame per call and otherwise asks for more bytes.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use thiserror::Error;

use super::constants::{FRAME_HEADER_LEN, FRAME_MAGIC, MAX_BODY_LEN};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad frame magic: got {found:02X?}, expected {:02X?}", FRAME_MAGIC)]
    BadMagic { found: [u8; 2] },

    #[error("declared body length {declared} exceeds limit {limit}")]
    OversizedBody { declared: usize, limit: usize },
}

/// An outgoing request, serialized once and discarded after send.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub command: u16,
    pub sequence: u32,
    pub body: Vec<u8>,
}

impl CommandFrame {
    pub fn new(command: u16, sequence: u32, body: Vec<u8>) -> Self {
        Self {
            command,
            sequence,
            body,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.write_u16::<BigEndian>(self.command).unwrap();
        buf.write_u32::<BigEndian>(self.sequence).unwrap();
        buf.write_u32::<BigEndian>(self.body.len() as u32).unwrap();
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// An inbound reply, reassembled from one or more bulk reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub command: u16,
    pub sequence: u32,
    pub body: Vec<u8>,
}

/// Accumulating decoder over an unreliable byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the header or the declared body is not fully
    /// buffered yet. The magic is validated before any other field is
    /// trusted; a mismatch means the stream has desynchronized.
    pub fn next_frame(&mut self) -> Result<Option<ResponseFrame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0..2] != FRAME_MAGIC {
            return Err(FrameError::BadMagic {
                found: [self.buf[0], self.buf[1]],
            });
        }
        let command = BigEndian::read_u16(&self.buf[2..4]);
        let sequence = BigEndian::read_u32(&self.buf[4..8]);
        let body_len = BigEndian::read_u32(&self.buf[8..12]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::OversizedBody {
                declared: body_len,
                limit: MAX_BODY_LEN,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + body_len {
            return Ok(None);
        }
        let body = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + body_len);
        Ok(Some(ResponseFrame {
            command,
            sequence,
            body,
        }))
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes. Used when recovering from a desync.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = CommandFrame::new(0x0010, 0x01020304, vec![0xAA, 0xBB]);
        let bytes = frame.encode();
        assert_eq!(
            bytes,
            vec![0x12, 0x34, 0x00, 0x10, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x02, 0xAA,
                 0xBB]
        );
    }

    #[test]
    fn decode_roundtrip() {
        let wire = CommandFrame::new(6, 42, vec![1, 2, 3, 4]).encode();
        let mut dec = FrameDecoder::new();
        dec.extend(&wire);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, 6);
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.body, vec![1, 2, 3, 4]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let wire = CommandFrame::new(4, 7, vec![0; 64]).encode();
        let mut dec = FrameDecoder::new();

        // Header alone is not enough
        dec.extend(&wire[..FRAME_HEADER_LEN]);
        assert!(dec.next_frame().unwrap().is_none());

        // Body short by one byte
        dec.extend(&wire[FRAME_HEADER_LEN..wire.len() - 1]);
        assert!(dec.next_frame().unwrap().is_none());

        dec.extend(&wire[wire.len() - 1..]);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.body.len(), 64);
    }

    #[test]
    fn two_frames_one_read() {
        let mut dec = FrameDecoder::new();
        let mut wire = CommandFrame::new(1, 1, vec![0x01]).encode();
        wire.extend(CommandFrame::new(2, 2, vec![0x02]).encode());
        dec.extend(&wire);

        // One complete frame per call
        assert_eq!(dec.next_frame().unwrap().unwrap().sequence, 1);
        assert_eq!(dec.next_frame().unwrap().unwrap().sequence, 2);
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn bad_magic_rejected_before_other_fields() {
        let mut dec = FrameDecoder::new();
        dec.extend(&[0xDE, 0xAD, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::BadMagic { found: [0xDE, 0xAD] })
        ));
    }

    #[test]
    fn oversized_body_rejected() {
        let mut dec = FrameDecoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_MAGIC);
        wire.extend_from_slice(&[0, 1, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]);
        dec.extend(&wire);
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::OversizedBody { .. })
        ));
    }
}
