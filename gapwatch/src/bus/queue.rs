use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use gapwatch_core::{Event, EventPriority};

/// Heap entry: higher priority first, then lower sequence first.
#[derive(Debug, Clone)]
pub(crate) struct Queued {
    pub priority: EventPriority,
    pub seq: u64,
    pub event: Arc<Event>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

/// Bounded max-heap of pending events.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    heap: BinaryHeap<Queued>,
    capacity: usize,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 0,
        }
    }

    /// Push unless full; a full queue hands the event back.
    pub fn push(&mut self, event: Arc<Event>, priority: EventPriority) -> Result<(), Arc<Event>> {
        if self.heap.len() >= self.capacity {
            return Err(event);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority,
            seq,
            event,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Queued> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
