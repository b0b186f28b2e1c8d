//! A min-heap of timed tasks.
//!
//! Used by the sync coordinator for retry wake-ups and debounced refetches.
//! The scheduler never reads a clock; callers pass `now`.

use crate::Timestamp;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug)]
struct Entry<T> {
    run_at: Timestamp,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.run_at, self.seq).cmp(&(other.run_at, other.seq))
    }
}

/// Tasks ordered by deadline; ties run in scheduling order.
#[derive(Debug)]
pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, run_at: Timestamp, task: T) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            run_at,
            seq: self.seq,
            task,
        }));
    }

    /// Remove and return every task due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.run_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.task);
            }
        }
        due
    }

    /// Deadline of the earliest task.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(entry)| entry.run_at)
    }

    pub fn contains(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.heap.iter().any(|Reverse(entry)| pred(&entry.task))
    }

    /// Drop every task matching `pred`; returns how many were dropped.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(entry)| !pred(&entry.task));
        before - self.heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
