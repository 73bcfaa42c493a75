//! Pulse-event payload decoder.
//!
//! Two payload shapes are legal on the wire:
//!
//! - **Current (16 bytes)**: `[identifier:1][padding:3][pulse_count:2 LE][unique_id:10]`.
//!   Offsets are fixed: identifier at 0, pulse count at 4..6, unique id at 6..16.
//! - **Legacy (any other length >= 3)**: `[identifier:1][...]` with the 16-bit
//!   pulse count occupying the *last two bytes* of the payload, little-endian,
//!   regardless of total payload length. No unique id is available; the event
//!   is synthesized with an all-zero id to signal the legacy format.
//!
//! Payloads shorter than 3 bytes are dropped as unparseable. An unrecognized
//! identifier byte does not abort decoding: it defaults to the card accepter
//! and the frame is still credited, since only the per-accepter attribution
//! would be wrong.

use crate::event::{AccepterId, PulseEvent, UNIQUE_ID_LEN};
use chrono::Utc;

/// Payload length of the current wire format carrying a unique id.
pub const CURRENT_PAYLOAD_LEN: usize = 16;
/// Minimum payload length the decoder accepts.
pub const MIN_PAYLOAD_LEN: usize = 3;

/// Offset of the pulse count within a current-format payload.
const CURRENT_COUNT_OFFSET: usize = 4;
/// Offset of the unique id within a current-format payload.
const CURRENT_ID_OFFSET: usize = 6;

/// Decode one complete frame payload into a [`PulseEvent`].
///
/// Returns `None` for payloads too short to parse; malformed frames are a
/// framing-level concern recovered by resynchronization and are only worth a
/// trace log here.
pub fn decode_pulse_payload(payload: &[u8]) -> Option<PulseEvent> {
    if payload.len() < MIN_PAYLOAD_LEN {
        tracing::trace!(len = payload.len(), "dropping unparseable short payload");
        return None;
    }

    let accepter = AccepterId::from_wire(payload[0]).unwrap_or_else(|| {
        tracing::warn!(
            identifier = payload[0],
            "unrecognized accepter identifier, defaulting to card accepter"
        );
        AccepterId::Card
    });

    let (raw_count, unique_id) = if payload.len() == CURRENT_PAYLOAD_LEN {
        let raw_count = u16::from_le_bytes([
            payload[CURRENT_COUNT_OFFSET],
            payload[CURRENT_COUNT_OFFSET + 1],
        ]);
        let mut unique_id = [0u8; UNIQUE_ID_LEN];
        unique_id.copy_from_slice(&payload[CURRENT_ID_OFFSET..CURRENT_ID_OFFSET + UNIQUE_ID_LEN]);
        (raw_count, unique_id)
    } else {
        // Legacy format: the counter rides in the last two bytes.
        let raw_count =
            u16::from_le_bytes([payload[payload.len() - 2], payload[payload.len() - 1]]);
        (raw_count, [0u8; UNIQUE_ID_LEN])
    };

    Some(PulseEvent {
        accepter,
        raw_count,
        unique_id,
        captured_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_payload(identifier: u8, count: u16, id: [u8; UNIQUE_ID_LEN]) -> Vec<u8> {
        let mut payload = vec![identifier, 0, 0, 0];
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&id);
        payload
    }

    #[test]
    fn test_decode_current_format() {
        let mut id = [0u8; UNIQUE_ID_LEN];
        id[0] = 0x42;
        let event = decode_pulse_payload(&current_payload(0x01, 517, id)).unwrap();
        assert_eq!(event.accepter, AccepterId::Bill);
        assert_eq!(event.raw_count, 517);
        assert_eq!(event.unique_id, id);
        assert!(event.has_unique_id());
    }

    #[test]
    fn test_decode_legacy_six_byte_payload() {
        // identifier, padding, count in the last two bytes (LE)
        let payload = [0x00, 0xee, 0xee, 0xee, 0x07, 0x00];
        let event = decode_pulse_payload(&payload).unwrap();
        assert_eq!(event.accepter, AccepterId::Card);
        assert_eq!(event.raw_count, 7);
        assert!(!event.has_unique_id());
    }

    #[test]
    fn test_decode_legacy_count_is_last_two_bytes_regardless_of_length() {
        let payload = [0x01, 0x03, 0x01]; // minimum length: count = 0x0103
        let event = decode_pulse_payload(&payload).unwrap();
        assert_eq!(event.raw_count, 0x0103);
    }

    #[test]
    fn test_short_payload_dropped() {
        assert!(decode_pulse_payload(&[0x00, 0x05]).is_none());
        assert!(decode_pulse_payload(&[]).is_none());
    }

    #[test]
    fn test_unknown_identifier_defaults_to_card() {
        let event = decode_pulse_payload(&current_payload(0x7f, 5, [1u8; UNIQUE_ID_LEN])).unwrap();
        assert_eq!(event.accepter, AccepterId::Card);
        assert_eq!(event.raw_count, 5);
    }
}
