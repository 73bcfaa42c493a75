//! Duplicate detection and credit computation.
//!
//! This is the core correctness contract of the whole subsystem, bridging two
//! firmware generations:
//!
//! - **Unique-id format**: each transaction arrives stamped with a 10-byte id.
//!   The full reported count is credited exactly once per id; redelivery is a
//!   pure set-membership skip, no counter arithmetic.
//! - **Legacy format** (all-zero id): firmware reports a cumulative counter,
//!   so only the increment since the last credited value is credited, with
//!   counter-reset detection (a lower value means the board rebooted and a
//!   new transaction is starting over).
//!
//! The guard is a plain struct with no internal locking. The orchestrator
//! holds it behind a single mutex and runs each [`evaluate`](DuplicateGuard::evaluate)
//! call as one critical section: the membership check, insertion, and counter
//! update must be collectively atomic so two near-simultaneous deliveries of
//! the same id cannot both be judged new.

use crate::event::{AccepterId, PulseEvent};
use std::collections::{HashMap, HashSet};

/// Outcome of the crediting decision for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditDecision {
    /// Whether a credit should be emitted at all.
    pub should_credit: bool,
    /// Amount to credit, in currency units. Zero when `should_credit` is false.
    pub amount: u32,
}

impl CreditDecision {
    fn credit(amount: u32) -> Self {
        Self {
            should_credit: true,
            amount,
        }
    }

    fn skip() -> Self {
        Self {
            should_credit: false,
            amount: 0,
        }
    }
}

/// In-memory dedup state for the crediting algorithm.
#[derive(Debug, Default)]
pub struct DuplicateGuard {
    /// Already-credited unique ids (lowercase hex). Hydrated from the durable
    /// store at startup; grows monotonically within a process run and is
    /// cleared only by explicit administrative reset, never by stop/start
    /// cycles. Clearing it on stop would reopen a double-credit window.
    processed_ids: HashSet<String>,
    /// Last successfully credited cumulative value per accepter, for the
    /// legacy format. Intra-session only; cleared on every stop/start cycle
    /// and carries no cross-restart guarantee.
    last_count: HashMap<AccepterId, u32>,
}

impl DuplicateGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge durably persisted unique ids into the dedup memory.
    pub fn hydrate(&mut self, ids: impl IntoIterator<Item = String>) {
        self.processed_ids.extend(ids);
    }

    /// Number of unique ids currently held in dedup memory.
    pub fn processed_id_count(&self) -> usize {
        self.processed_ids.len()
    }

    /// Clear the legacy per-accepter counters. Called on every session stop;
    /// the unique-id set is deliberately left intact.
    pub fn clear_session_counters(&mut self) {
        self.last_count.clear();
    }

    /// Administrative reset of both dedup tiers. This is the only path that
    /// may clear the unique-id set.
    pub fn clear_all(&mut self) {
        self.processed_ids.clear();
        self.last_count.clear();
    }

    /// Decide whether and how much to credit for one decoded event.
    ///
    /// Mutates the dedup state in the same call; the caller must hold its
    /// lock across the entire invocation.
    pub fn evaluate(&mut self, event: &PulseEvent) -> CreditDecision {
        let count = u32::from(event.raw_count);

        if event.has_unique_id() {
            let hex = event.unique_id_hex();
            if self.processed_ids.contains(&hex) {
                tracing::debug!(unique_id = %hex, "duplicate unique id, skipping credit");
                return CreditDecision::skip();
            }
            self.processed_ids.insert(hex);
            // Cross-format bookkeeping only; the credit is the full count.
            self.last_count.insert(event.accepter, count);
            return CreditDecision::credit(count);
        }

        // Legacy format: delta tracking against the last credited value.
        // "No entry" is the first-observation sentinel; a -1 style default
        // would over-credit by one on the first event.
        let decision = match self.last_count.get(&event.accepter).copied() {
            None => CreditDecision::credit(count),
            Some(last) if count == last => {
                tracing::debug!(
                    accepter = %event.accepter,
                    count,
                    "legacy counter unchanged, duplicate retransmission"
                );
                return CreditDecision::skip();
            }
            Some(last) if count < last => {
                // Firmware counter reset (board reboot): a new transaction
                // starting over, credit the full reported count.
                tracing::info!(
                    accepter = %event.accepter,
                    last,
                    count,
                    "legacy counter reset detected"
                );
                CreditDecision::credit(count)
            }
            Some(last) => {
                let amount = match count.checked_sub(last) {
                    Some(delta) if delta > 0 => delta,
                    // Unreachable given the branches above; credit the full
                    // count rather than lose the transaction.
                    _ => {
                        tracing::warn!(
                            accepter = %event.accepter,
                            last,
                            count,
                            "non-positive legacy delta, crediting full count"
                        );
                        count
                    }
                };
                CreditDecision::credit(amount)
            }
        };

        self.last_count.insert(event.accepter, count);
        decision
    }
}
