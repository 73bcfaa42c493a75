//! Bounded persistence retry queue.
//!
//! Persistence failures never reach the credit emission path; the failed
//! record is queued here and a background task drains the queue on a fixed
//! interval. The queue is bounded: once full, new failures are dropped with
//! an error-level log. That drop is the one documented point where durability
//! is knowingly sacrificed during a sustained storage outage - the in-memory
//! dedup state still prevents double-crediting within the process run.

use crate::event::ProcessedIdRecord;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One persistence attempt awaiting retry.
#[derive(Debug, Clone)]
pub struct RetryItem {
    /// The record that failed to persist.
    pub record: ProcessedIdRecord,
    /// When the first persistence attempt failed.
    pub first_failed_at: DateTime<Utc>,
}

impl RetryItem {
    /// Wrap a freshly failed record.
    pub fn new(record: ProcessedIdRecord) -> Self {
        Self {
            record,
            first_failed_at: Utc::now(),
        }
    }
}

/// FIFO queue of failed persistence attempts, bounded by capacity.
#[derive(Debug)]
pub struct RetryQueue {
    items: VecDeque<RetryItem>,
    capacity: usize,
    dropped_total: u64,
}

impl RetryQueue {
    /// Create a queue retaining at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped_total: 0,
        }
    }

    /// Enqueue a failed persistence attempt.
    ///
    /// Returns `false` when the queue is at capacity and the item was dropped;
    /// the drop is logged at error level with the affected id.
    pub fn push(&mut self, item: RetryItem) -> bool {
        if self.items.len() >= self.capacity {
            self.dropped_total += 1;
            tracing::error!(
                unique_id = %item.record.unique_id_hex,
                capacity = self.capacity,
                dropped_total = self.dropped_total,
                "retry queue full, dropping persistence retry; durability lost for this id"
            );
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Remove and return every queued item, oldest first.
    pub fn drain(&mut self) -> Vec<RetryItem> {
        self.items.drain(..).collect()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total items ever dropped due to the capacity bound.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> RetryItem {
        RetryItem::new(ProcessedIdRecord {
            unique_id_hex: id.to_string(),
            accepter: "bill_accepter".to_string(),
            pulse_count: 1,
            amount_credited: 1,
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn test_capacity_bound_drops_overflow() {
        // 150 consecutive failures must retain at most 100 items.
        let mut queue = RetryQueue::new(100);
        let mut accepted = 0;
        for i in 0..150 {
            if queue.push(item(&format!("{i:04x}"))) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.dropped_total(), 50);
    }

    #[test]
    fn test_drain_empties_in_fifo_order() {
        let mut queue = RetryQueue::new(10);
        queue.push(item("aa"));
        queue.push(item("bb"));

        let drained = queue.drain();
        assert!(queue.is_empty());
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].record.unique_id_hex, "aa");
        assert_eq!(drained[1].record.unique_id_hex, "bb");
    }
}
