// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded in-memory rings the server keeps for its own debug surface: the
//! last RPC lines exchanged and the last stderr lines emitted by tracing.
//! Both evict the oldest entry once full rather than grow unbounded.

use std::collections::VecDeque;

use serde::Serialize;

const RPC_RING_CAPACITY: usize = 200;
const STDERR_RING_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct RpcLogEntry {
    pub direction: Direction,
    pub line: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A ring buffer with a fixed capacity; pushing past capacity drops the
/// oldest entry. Used for both the RPC and stderr rings, just with
/// different element types and capacities.
pub struct BoundedRing<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BoundedRing<RpcLogEntry> {
    fn default() -> Self {
        Self::new(RPC_RING_CAPACITY)
    }
}

pub fn new_rpc_ring() -> BoundedRing<RpcLogEntry> {
    BoundedRing::new(RPC_RING_CAPACITY)
}

pub fn new_stderr_ring() -> BoundedRing<String> {
    BoundedRing::new(STDERR_RING_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_ring_evicts_oldest_past_capacity() {
        let mut ring = BoundedRing::new(2);
        ring.push(RpcLogEntry { direction: Direction::Inbound, line: "a".into() });
        ring.push(RpcLogEntry { direction: Direction::Inbound, line: "b".into() });
        ring.push(RpcLogEntry { direction: Direction::Outbound, line: "c".into() });
        let lines: Vec<&str> = ring.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn stderr_ring_caps_at_fifty() {
        let mut ring = new_stderr_ring();
        for i in 0..60 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.len(), 50);
        assert_eq!(ring.iter().next().unwrap(), "line 10");
    }
}
