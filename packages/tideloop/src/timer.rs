//! Timer heap keyed by `(due time, task id)`.
//!
//! Cancellation is logical: a cancelled timer stays in the heap as a tombstone
//! and is dropped when it reaches the head. Tombstones are counted so a heap
//! full of cancelled far-future timers can be compacted eagerly.

use crate::task::{Task, TaskId};
use crate::time::Time;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// Entry in the timer heap
struct TimerEntry {
    /// Due time this entry was pushed with
    due: Time,
    /// Tie-break for equal due times
    id: TaskId,
    task: Rc<Task>,
}

// Reverse ordering for min-heap (earliest due time, then lowest id, first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for TimerEntry {}

pub(crate) struct TimerQueue {
    heap: RefCell<BinaryHeap<TimerEntry>>,
    tombstones: Cell<usize>,
    compaction_threshold: usize,
}

impl TimerQueue {
    pub(crate) fn new(compaction_threshold: usize) -> Self {
        Self {
            heap: RefCell::new(BinaryHeap::new()),
            tombstones: Cell::new(0),
            compaction_threshold,
        }
    }

    /// Inserts a timer at its current due time.
    pub(crate) fn push(&self, task: Rc<Task>) {
        let Some(due) = task.due() else {
            debug_assert!(false, "timer task {} has no due time", task.id());
            return;
        };
        let id = task.id();
        self.heap.borrow_mut().push(TimerEntry { due, id, task });
    }

    /// Earliest live due time.
    pub(crate) fn next_due(&self) -> Option<Time> {
        self.purge_head();
        self.heap.borrow().peek().map(|entry| entry.due)
    }

    /// True if the earliest live timer is due at or before `now`.
    pub(crate) fn peek_due(&self, now: Time) -> bool {
        self.next_due().is_some_and(|due| due <= now)
    }

    /// Removes the earliest live timer if it is due, returning it together
    /// with the due time it was scheduled for.
    pub(crate) fn pop_due(&self, now: Time) -> Option<(Rc<Task>, Time)> {
        if !self.peek_due(now) {
            return None;
        }
        self.heap
            .borrow_mut()
            .pop()
            .map(|entry| (entry.task, entry.due))
    }

    /// Records that a timer still in the heap was cancelled.
    pub(crate) fn note_cancelled(&self) {
        let tombstones = self.tombstones.get() + 1;
        self.tombstones.set(tombstones);
        let len = self.heap.borrow().len();
        if tombstones > self.compaction_threshold && tombstones * 2 > len {
            self.compact();
        }
    }

    /// Live timers, not counting tombstones.
    pub(crate) fn len(&self) -> usize {
        self.heap.borrow().len().saturating_sub(self.tombstones.get())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.next_due().is_none()
    }

    fn purge_head(&self) {
        let mut heap = self.heap.borrow_mut();
        while heap.peek().is_some_and(|entry| entry.task.is_cancelled()) {
            heap.pop();
            self.tombstones.set(self.tombstones.get().saturating_sub(1));
        }
    }

    fn compact(&self) {
        let mut heap = self.heap.borrow_mut();
        let before = heap.len();
        heap.retain(|entry| !entry.task.is_cancelled());
        tracing::trace!(removed = before - heap.len(), "compacted timer heap");
        self.tombstones.set(0);
    }
}
