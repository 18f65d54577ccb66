//! Queue of work blocked by cooldown, ordered by ready time

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

/// Deferred items, popped earliest ready time first (FIFO among equal times)
#[derive(Debug)]
pub struct DeferredQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Park `item` until `ready_at`
    pub fn push(&mut self, ready_at: Instant, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            ready_at,
            seq,
            item,
        }));
    }

    /// Remove the item with the earliest ready time, whether or not it is ready yet
    pub fn pop_next(&mut self) -> Option<(Instant, T)> {
        self.heap
            .pop()
            .map(|Reverse(entry)| (entry.ready_at, entry.item))
    }

    /// Earliest ready time in the queue
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.ready_at)
    }

    /// Number of parked items
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove all items in ready-time order
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some((_, item)) = self.pop_next() {
            out.push(item);
        }
        out
    }
}
