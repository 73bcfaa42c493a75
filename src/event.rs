//! Core data types flowing through the pipeline.
//!
//! # Data Flow
//!
//! ```text
//! bytes --> FrameAccumulator --> decoder --[PulseEvent]--> DuplicateGuard
//!                                                              |
//!                                            broadcast <--[CreditDelta]
//!                                            store     <--[ProcessedIdRecord]
//! ```
//!
//! `PulseEvent` is ephemeral: constructed once per decoded frame, consumed
//! immediately by the dedup decision, never mutated, never retained.
//! `ProcessedIdRecord` is the durable shape written to the persistence layer;
//! `CreditDelta` is the sole outward notification owed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the firmware-stamped per-transaction unique id, in bytes.
pub const UNIQUE_ID_LEN: usize = 10;

/// Which physical accepter on the controller board produced the pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccepterId {
    /// Card reader (wire value `0x00`).
    Card,
    /// Bill acceptor (wire value `0x01`).
    Bill,
}

impl AccepterId {
    /// Map a wire identifier byte to an accepter, if recognized.
    ///
    /// `0x00` is the card accepter, `0x01` the bill accepter. The decoder
    /// defaults unrecognized values to [`AccepterId::Card`] rather than
    /// dropping the frame, since a malformed identifier is still worth
    /// crediting.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Card),
            0x01 => Some(Self::Bill),
            _ => None,
        }
    }

    /// Stable lowercase name used in durable records and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Card => "card_accepter",
            Self::Bill => "bill_accepter",
        }
    }
}

impl fmt::Display for AccepterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded pulse/credit event off the wire.
///
/// Produced by the decoder, consumed immediately by the
/// [`DuplicateGuard`](crate::guard::DuplicateGuard); never retained beyond
/// the crediting decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseEvent {
    /// Which physical accepter produced the pulses.
    pub accepter: AccepterId,
    /// Cumulative pulse counter as reported by firmware. In the current wire
    /// format this is the full amount for the transaction; in the legacy
    /// format it is a cumulative counter and only the delta is credited.
    pub raw_count: u16,
    /// Firmware-stamped per-transaction unique id. All zeros signals the
    /// legacy format with no unique id available.
    pub unique_id: [u8; UNIQUE_ID_LEN],
    /// Process-local capture timestamp (not the device clock).
    pub captured_at: DateTime<Utc>,
}

impl PulseEvent {
    /// Whether this event carries a firmware unique id (current wire format).
    pub fn has_unique_id(&self) -> bool {
        self.unique_id.iter().any(|b| *b != 0)
    }

    /// Lowercase hex rendering of the unique id, the durable dedup key.
    pub fn unique_id_hex(&self) -> String {
        hex_lower(&self.unique_id)
    }
}

/// The amount this subsystem determined should be applied to a balance as a
/// result of one decoded event.
///
/// This is the only output the orchestrator owes to subscribers. It carries no
/// indication of whether persistence succeeded; persistence failure is retried
/// internally and never blocks or reverses a credit already emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditDelta {
    /// Which accepter the credit is attributed to.
    pub accepter: AccepterId,
    /// Amount to credit, in currency units (1 pulse = 1 unit).
    pub amount: u32,
    /// The raw counter value the amount was derived from.
    pub raw_count: u16,
    /// Unique id of the originating event (all zeros for legacy frames).
    pub unique_id: [u8; UNIQUE_ID_LEN],
    /// Capture timestamp of the originating event.
    pub timestamp: DateTime<Utc>,
}

/// Durable record of a credited unique id.
///
/// Created on first successful credit of a unique id; never updated; deleted
/// only by time-based cleanup. `unique_id_hex` uniqueness is the durable
/// de-duplication invariant, so stores must implement insert-or-ignore
/// semantics: racing duplicate inserts are harmless no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedIdRecord {
    /// Lowercase hex unique id; primary key.
    pub unique_id_hex: String,
    /// Stable accepter name (see [`AccepterId::name`]).
    pub accepter: String,
    /// Raw pulse count reported by firmware.
    pub pulse_count: u16,
    /// Amount actually credited for this id.
    pub amount_credited: u32,
    /// When the credit was issued.
    pub recorded_at: DateTime<Utc>,
}

/// Render bytes as a lowercase hex string.
pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{b:02x}");
    }
    out
}
