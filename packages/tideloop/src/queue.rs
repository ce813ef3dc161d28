use crate::task::Task;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A simple FIFO queue for tasks.
/// The scheduler is single-threaded, so a RefCell<VecDeque> is enough; no
/// borrow is held while a popped task runs, which lets actions push freely.
#[derive(Default)]
struct TaskQueue {
    queue: RefCell<VecDeque<Rc<Task>>>,
}

impl TaskQueue {
    fn push(&self, task: Rc<Task>) {
        self.queue.borrow_mut().push_back(task);
    }

    fn pop(&self) -> Option<Rc<Task>> {
        self.queue.borrow_mut().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

/// Highest-priority tasks, drained to empty before any timer or macrotask.
#[derive(Default)]
pub(crate) struct ImmediateQueue {
    inner: TaskQueue,
}

impl ImmediateQueue {
    pub(crate) fn push(&self, task: Rc<Task>) {
        self.inner.push(task);
    }

    /// Pops and hands over tasks one at a time until the queue is observably
    /// empty, including tasks pushed by `run` itself during the drain.
    pub(crate) fn drain_with(&self, mut run: impl FnMut(Rc<Task>)) -> usize {
        let mut drained = 0;
        while let Some(task) = self.inner.pop() {
            run(task);
            drained += 1;
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Completed external work and deferred later-phase tasks, in arrival order.
#[derive(Default)]
pub(crate) struct MacrotaskQueue {
    inner: TaskQueue,
}

impl MacrotaskQueue {
    pub(crate) fn push(&self, task: Rc<Task>) {
        self.inner.push(task);
    }

    pub(crate) fn pop_front(&self) -> Option<Rc<Task>> {
        self.inner.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
