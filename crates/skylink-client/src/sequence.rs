//! Per-protocol request sequence numbers.

use std::collections::HashMap;

/// First sequence number handed out on a fresh connection.
pub const FIRST_SEQUENCE: u64 = 1;

/// Hands out strictly increasing sequence numbers, one counter per protocol.
///
/// Counters live as long as the connection: the server forgets a
/// connection's sequence space when it drops, so [`SequenceAllocator::reset`]
/// runs on every reconnect, after pending calls have been failed out.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: HashMap<u32, u64>,
}

impl SequenceAllocator {
    /// Creates an allocator with no counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence for `protocol`.
    pub fn next(&mut self, protocol: u32) -> u64 {
        let slot = self.next.entry(protocol).or_insert(FIRST_SEQUENCE);
        let sequence = *slot;
        *slot += 1;
        sequence
    }

    /// Forgets every counter.
    pub fn reset(&mut self) {
        self.next.clear();
    }
}
