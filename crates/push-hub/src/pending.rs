//! Per-entity buffer of undeliverable payloads.
//!
//! Bounded FIFO with drop-oldest eviction. Every entry carries a sequence
//! number so a replay can trim exactly what it delivered, even when new
//! payloads arrive (and old ones are evicted) while it runs.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::time::Instant;

/// Default per-entity capacity.
pub const DEFAULT_PENDING_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub seq: u64,
    pub payload: Value,
}

#[derive(Debug)]
pub struct PendingBuffer {
    entries: VecDeque<PendingEntry>,
    capacity: usize,
    next_seq: u64,
    last_push: Instant,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
            last_push: Instant::now(),
        }
    }

    /// Append a payload, evicting and returning the oldest entry when full.
    pub fn push(&mut self, payload: Value) -> Option<PendingEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.next_seq += 1;
        self.last_push = Instant::now();
        self.entries.push_back(PendingEntry {
            seq: self.next_seq,
            payload,
        });
        evicted
    }

    /// Copy of the entries in enqueue order.
    pub fn snapshot(&self) -> Vec<PendingEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Drop every entry up to and including `seq`.
    pub fn remove_through(&mut self, seq: u64) {
        while self.entries.front().is_some_and(|e| e.seq <= seq) {
            self.entries.pop_front();
        }
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.payload.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// When the most recent payload was appended.
    pub fn last_push(&self) -> Instant {
        self.last_push
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}
