//! Priority tiers and the task queue
//!
//! Tasks are ordered by priority tier first, then by submission order within
//! a tier. There is no deadline or aging: a later high-priority request
//! always overtakes an earlier low-priority one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Request priority
///
/// Higher variants are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Prefetching and other speculative work
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    /// Needed right now, e.g. an on-screen thumbnail
    Immediate = 3,
}

/// Unique task identifier
pub type TaskId = u64;

struct Queued<T> {
    id: TaskId,
    priority: Priority,
    /// Submission order (used for FIFO within same priority)
    seq: u64,
    item: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap, so earlier submissions compare greater
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

/// Priority queue of pending items
///
/// Not synchronized; the executor guards it with its own lock.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Queued<T>>,
    next_id: TaskId,
    seq: u64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 1,
            seq: 0,
        }
    }

    /// Queue an item and return its id.
    pub fn push(&mut self, priority: Priority, item: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Queued {
            id,
            priority,
            seq,
            item,
        });
        id
    }

    /// Pop the highest priority, earliest submitted item.
    pub fn pop(&mut self) -> Option<(TaskId, Priority, T)> {
        self.heap.pop().map(|q| (q.id, q.priority, q.item))
    }

    /// Remove a still-queued item by id.
    pub fn remove(&mut self, id: TaskId) -> Option<T> {
        if !self.heap.iter().any(|q| q.id == id) {
            return None;
        }
        let mut items = std::mem::take(&mut self.heap).into_vec();
        let removed = items
            .iter()
            .position(|q| q.id == id)
            .map(|pos| items.swap_remove(pos).item);
        self.heap = BinaryHeap::from(items);
        removed
    }

    /// Remove every queued item, in no particular order.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|q| q.item)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_order(queue: &mut PriorityQueue<&'static str>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.pop().map(|(_, _, item)| item)).collect()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Immediate > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "low");
        queue.push(Priority::High, "high");
        queue.push(Priority::Normal, "normal");
        queue.push(Priority::Immediate, "now");

        assert_eq!(drain_order(&mut queue), vec!["now", "high", "normal", "low"]);
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Normal, "first");
        queue.push(Priority::Normal, "second");
        queue.push(Priority::Normal, "third");

        assert_eq!(drain_order(&mut queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_mixed_priority_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "low-1");
        queue.push(Priority::High, "high-1");
        queue.push(Priority::Low, "low-2");
        queue.push(Priority::High, "high-2");
        queue.push(Priority::Normal, "normal-1");

        assert_eq!(
            drain_order(&mut queue),
            vec!["high-1", "high-2", "normal-1", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = PriorityQueue::new();
        let a = queue.push(Priority::Normal, "a");
        let b = queue.push(Priority::Normal, "b");
        queue.push(Priority::Normal, "c");

        assert_eq!(queue.remove(b), Some("b"));
        assert_eq!(queue.remove(b), None);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|(id, _, _)| id), Some(a));
        assert_eq!(drain_order(&mut queue), vec!["c"]);
    }

    #[test]
    fn test_drain() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, 1);
        queue.push(Priority::High, 2);

        let mut items = queue.drain();
        items.sort();
        assert_eq!(items, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut queue = PriorityQueue::new();
        let a = queue.push(Priority::Low, ());
        let b = queue.push(Priority::Low, ());
        assert_ne!(a, b);
    }
}
