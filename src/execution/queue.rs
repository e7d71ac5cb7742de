//! Execution Queue
//!
//! Pending executions ordered by priority, then submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::debug;

use crate::workflow::Priority;

/// Queue entry for one execution.
#[derive(Debug, Clone)]
pub struct QueuedExecution {
    pub execution_id: String,
    pub priority: Priority,
    /// Submission sequence number; lower was submitted earlier
    pub seq: u64,
}

impl PartialEq for QueuedExecution {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedExecution {}

impl PartialOrd for QueuedExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedExecution {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submission
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

/// Max-heap of pending executions.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    heap: BinaryHeap<QueuedExecution>,
    next_seq: u64,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an execution and returns its sequence number.
    pub fn push(&mut self, execution_id: impl Into<String>, priority: Priority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = QueuedExecution {
            execution_id: execution_id.into(),
            priority,
            seq,
        };
        debug!(
            "Enqueueing execution {} (priority: {}, seq: {})",
            entry.execution_id, priority, seq
        );
        self.heap.push(entry);
        seq
    }

    /// Removes the highest-priority, earliest-submitted execution.
    pub fn pop(&mut self) -> Option<QueuedExecution> {
        self.heap.pop()
    }

    /// Drops an execution from the queue. Returns true if it was queued.
    pub fn remove(&mut self, execution_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.execution_id != execution_id);
        self.heap.len() != before
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.heap.iter().any(|e| e.execution_id == execution_id)
    }

    /// Empties the queue, returning entries in dequeue order.
    pub fn drain(&mut self) -> Vec<QueuedExecution> {
        let mut entries = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            entries.push(entry);
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
