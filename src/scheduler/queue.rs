//! Priority queue of tasks ready for dispatch.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::core::model::Priority;
use crate::core::types::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    id: TaskId,
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then older, then earlier insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ready tasks ordered by priority, then submission time.
///
/// Removal is lazy: removed entries stay in the heap and are skipped on pop.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<QueueEntry>,
    members: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Re-pushing a queued task moves it behind its peers.
    pub fn push(&mut self, id: TaskId, priority: Priority, created_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(id.clone(), seq);
        self.heap.push(QueueEntry {
            id,
            priority,
            created_at,
            seq,
        });
    }

    /// Take the highest-ranked task.
    pub fn pop(&mut self) -> Option<TaskId> {
        while let Some(entry) = self.heap.pop() {
            if self.members.get(&entry.id) == Some(&entry.seq) {
                self.members.remove(&entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    /// Drop a task from the queue. Returns whether it was queued.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        let removed = self.members.remove(id).is_some();
        if self.members.is_empty() {
            self.heap.clear();
        }
        removed
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
