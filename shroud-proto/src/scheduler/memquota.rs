//! Process-wide accounting for queued-cell memory.
//!
//! Every cell queued for transmission is charged against one global
//! ceiling.  When the total crosses the ceiling, we shed load by
//! closing whole circuits, not by dropping individual cells: dropping
//! a cell in the middle of a circuit would corrupt its crypto state.
//! The victim is the circuit holding the oldest queued cell, which is
//! the one making the least forward progress per byte of memory held.

use std::collections::HashMap;
use std::hash::Hash;

/// Tracks queued-cell memory across every scheduler in the process.
///
/// The key type identifies one circuit queue; the channel layer uses
/// a (channel id, circuit id) pair.
pub struct MemAccountant<K: Hash + Eq + Clone> {
    /// The configured ceiling, in bytes.
    ceiling: usize,
    /// Total bytes currently accounted.
    total: usize,
    /// Per-queue state.
    queues: HashMap<K, QueueStat>,
}

/// Accounting record for a single circuit's queue.
struct QueueStat {
    /// Bytes held by this queue.
    bytes: usize,
    /// Sequence numbers of the queued cells, oldest first.
    seqs: std::collections::VecDeque<u64>,
}

impl<K: Hash + Eq + Clone> MemAccountant<K> {
    /// Create a new accountant with the given ceiling.
    pub fn new(ceiling: usize) -> Self {
        MemAccountant {
            ceiling,
            total: 0,
            queues: HashMap::new(),
        }
    }

    /// Record that a cell of `bytes` bytes with sequence number `seq`
    /// was queued for `key`.
    pub(crate) fn note_queued(&mut self, key: K, seq: u64, bytes: usize) {
        self.total += bytes;
        let q = self.queues.entry(key).or_insert_with(|| QueueStat {
            bytes: 0,
            seqs: std::collections::VecDeque::new(),
        });
        q.bytes += bytes;
        q.seqs.push_back(seq);
    }

    /// Record that the oldest queued cell for `key` was sent.
    pub(crate) fn note_sent(&mut self, key: &K, bytes: usize) {
        if let Some(q) = self.queues.get_mut(key) {
            q.bytes = q.bytes.saturating_sub(bytes);
            let _ = q.seqs.pop_front();
            self.total = self.total.saturating_sub(bytes);
            if q.seqs.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    /// Remove a queue entirely (its circuit closed); return the bytes
    /// freed.
    pub(crate) fn remove_queue(&mut self, key: &K) -> usize {
        match self.queues.remove(key) {
            Some(q) => {
                self.total = self.total.saturating_sub(q.bytes);
                q.bytes
            }
            None => 0,
        }
    }

    /// Return the total accounted bytes.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Return true if the accounted total exceeds the ceiling.
    pub fn over_ceiling(&self) -> bool {
        self.total > self.ceiling
    }

    /// Pick the circuit to close when we are over the ceiling: the
    /// one holding the oldest queued cell.
    ///
    /// Returns None when nothing is queued.
    pub fn victim(&self) -> Option<K> {
        self.queues
            .iter()
            .filter_map(|(k, q)| q.seqs.front().map(|seq| (k, *seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(k, _)| k.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::CELL_WIRE_LEN;

    #[test]
    fn shed_oldest_first() {
        // A ceiling sized so that only four full circuit queues fit.
        let per_circ = 10 * CELL_WIRE_LEN;
        let mut acct: MemAccountant<u32> = MemAccountant::new(4 * per_circ);

        let mut seq = 0_u64;
        // Fill four circuits to the limit.
        for circ in 1..=4 {
            for _ in 0..10 {
                acct.note_queued(circ, seq, CELL_WIRE_LEN);
                seq += 1;
            }
        }
        assert!(!acct.over_ceiling());

        // The fifth circuit pushes us over; the victim must be the
        // circuit with the oldest queued cell: circuit 1.
        acct.note_queued(5, seq, CELL_WIRE_LEN);
        assert!(acct.over_ceiling());
        assert_eq!(acct.victim(), Some(1));

        // After closing the victim, the fifth circuit proceeds.
        acct.remove_queue(&1);
        assert!(!acct.over_ceiling());
        assert_eq!(acct.total(), 3 * per_circ + CELL_WIRE_LEN);
    }

    #[test]
    fn sending_advances_oldest() {
        let mut acct: MemAccountant<u32> = MemAccountant::new(usize::MAX);
        acct.note_queued(7, 0, CELL_WIRE_LEN);
        acct.note_queued(8, 1, CELL_WIRE_LEN);
        acct.note_queued(7, 2, CELL_WIRE_LEN);
        assert_eq!(acct.victim(), Some(7));
        acct.note_sent(&7, CELL_WIRE_LEN);
        assert_eq!(acct.victim(), Some(8));
        acct.note_sent(&8, CELL_WIRE_LEN);
        assert_eq!(acct.victim(), Some(7));
        acct.note_sent(&7, CELL_WIRE_LEN);
        assert_eq!(acct.victim(), None);
        assert_eq!(acct.total(), 0);
    }
}
