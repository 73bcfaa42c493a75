//! Wire framing state machine.
//!
//! Frames have the fixed header `[type:1][cmd:1][len:2 LE]` followed by `len`
//! payload bytes. Only `type=0x02, cmd=0x02` is a recognized pulse-event
//! frame. Any other byte at the buffer head is discarded one byte at a time
//! until the two-byte header matches again; this byte-at-a-time
//! resynchronization is the sole recovery mechanism for stream corruption or
//! a connection made mid-frame.
//!
//! The accumulator tolerates:
//! - **Partial frames**: fewer than `4 + len` buffered bytes yield no frame
//!   until more data arrives; the parse loop never blocks on a partial frame.
//! - **Coalesced frames**: after one complete frame is consumed, parsing
//!   immediately re-attempts on the buffer remainder.

use bytes::{Buf, Bytes, BytesMut};

/// Frame type byte identifying a pulse-event frame.
pub const FRAME_TYPE_PULSE: u8 = 0x02;
/// Frame command byte identifying a pulse-event frame.
pub const FRAME_CMD_PULSE: u8 = 0x02;
/// Fixed header length: type, cmd, and a little-endian u16 payload length.
pub const HEADER_LEN: usize = 4;

/// Sanity cap on the claimed payload length. A header claiming more than this
/// is treated as stream corruption and resynchronized past, so a garbage
/// length byte can never stall the parser waiting for data that will never
/// arrive.
const MAX_PAYLOAD_LEN: usize = 1024;

/// Accumulates raw transport bytes and slices out complete pulse-event frames.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read transport bytes.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempt to slice the next complete frame payload off the buffer head.
    ///
    /// Returns `None` when no complete frame is buffered yet. Call repeatedly
    /// after each [`push_bytes`](Self::push_bytes) until it returns `None`, so
    /// coalesced frames are all consumed before the next transport read.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if self.buf[0] != FRAME_TYPE_PULSE || self.buf[1] != FRAME_CMD_PULSE {
                tracing::trace!(byte = self.buf[0], "discarding unrecognized byte");
                self.buf.advance(1);
                continue;
            }
            let payload_len = usize::from(u16::from_le_bytes([self.buf[2], self.buf[3]]));
            if payload_len > MAX_PAYLOAD_LEN {
                tracing::debug!(payload_len, "implausible frame length, resynchronizing");
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + payload_len {
                // Partial frame; wait for more data.
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(payload_len).freeze());
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![FRAME_TYPE_PULSE, FRAME_CMD_PULSE];
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_complete_frame() {
        let mut acc = FrameAccumulator::new();
        acc.push_bytes(&frame(&[1, 2, 3]));
        assert_eq!(acc.next_frame().as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(acc.next_frame(), None);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_resync_past_garbage() {
        let mut acc = FrameAccumulator::new();
        let mut stream = vec![0xff, 0x13];
        stream.extend_from_slice(&frame(&[9, 9, 9]));
        acc.push_bytes(&stream);
        assert_eq!(acc.next_frame().as_deref(), Some(&[9u8, 9, 9][..]));
    }

    #[test]
    fn test_partial_frame_waits_for_remainder() {
        let mut acc = FrameAccumulator::new();
        let full = frame(&[0u8; 16]);
        // Header claims 16 bytes, only 10 present.
        acc.push_bytes(&full[..HEADER_LEN + 10]);
        assert_eq!(acc.next_frame(), None);
        acc.push_bytes(&full[HEADER_LEN + 10..]);
        assert_eq!(acc.next_frame().as_deref(), Some(&[0u8; 16][..]));
    }

    #[test]
    fn test_coalesced_frames() {
        let mut acc = FrameAccumulator::new();
        let mut stream = frame(&[1]);
        stream.extend_from_slice(&frame(&[2]));
        acc.push_bytes(&stream);
        assert_eq!(acc.next_frame().as_deref(), Some(&[1u8][..]));
        assert_eq!(acc.next_frame().as_deref(), Some(&[2u8][..]));
        assert_eq!(acc.next_frame(), None);
    }

    #[test]
    fn test_implausible_length_resynchronizes() {
        let mut acc = FrameAccumulator::new();
        // Valid type/cmd but an absurd length, then a real frame.
        let mut stream = vec![FRAME_TYPE_PULSE, FRAME_CMD_PULSE, 0xff, 0xff];
        stream.extend_from_slice(&frame(&[7, 7, 7]));
        acc.push_bytes(&stream);
        assert_eq!(acc.next_frame().as_deref(), Some(&[7u8, 7, 7][..]));
    }

    #[test]
    fn test_wrong_command_discarded() {
        let mut acc = FrameAccumulator::new();
        let mut stream = vec![FRAME_TYPE_PULSE, 0x05, 0x02, 0x00, 0xaa, 0xbb];
        stream.extend_from_slice(&frame(&[4]));
        acc.push_bytes(&stream);
        assert_eq!(acc.next_frame().as_deref(), Some(&[4u8][..]));
    }
}
