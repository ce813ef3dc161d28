//! Failure reporting.
//!
//! Every task remembers which task scheduled it. When an action fails, the
//! loop hands a [`TaskFailure`] to the installed [`DiagnosticSink`] carrying
//! that causation chain, so an asynchronous call chain can be reconstructed
//! across queue hops even though no stack survives between them.

use crate::error::TaskExecutionError;
use crate::task::{TaskId, TaskKind};
use serde::Serialize;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Ancestors of a task, nearest first.
///
/// The first entry is the task whose action scheduled this one; the last is
/// the earliest ancestor still recorded. Tasks scheduled outside of any action
/// have an empty chain. Chains longer than the configured depth are cut and
/// flagged as truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Causation {
    ancestors: SmallVec<[TaskId; 8]>,
    truncated: bool,
}

impl Causation {
    pub(crate) fn child_of(parent: TaskId, parent_chain: &Causation, depth: usize) -> Self {
        let mut ancestors = SmallVec::with_capacity(depth.min(parent_chain.len() + 1));
        ancestors.push(parent);
        let room = depth.saturating_sub(1);
        ancestors.extend(parent_chain.ancestors.iter().copied().take(room));
        let truncated = parent_chain.truncated || parent_chain.len() > room;
        Self {
            ancestors,
            truncated,
        }
    }

    /// The task whose action scheduled this one.
    pub fn caused_by(&self) -> Option<TaskId> {
        self.ancestors.first().copied()
    }

    /// Earliest recorded ancestor.
    pub fn origin(&self) -> Option<TaskId> {
        self.ancestors.last().copied()
    }

    pub fn ancestors(&self) -> &[TaskId] {
        &self.ancestors
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.ancestors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }
}

impl fmt::Display for Causation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ancestors.is_empty() {
            return f.write_str("<entry>");
        }
        for (i, id) in self.ancestors.iter().enumerate() {
            if i > 0 {
                f.write_str(" <- ")?;
            }
            write!(f, "{id}")?;
        }
        if self.truncated {
            f.write_str(" <- ...")?;
        }
        Ok(())
    }
}

/// Structured record of a failed task.
#[derive(Debug)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub causation: Causation,
    pub error: TaskExecutionError,
}

impl TaskFailure {
    pub fn caused_by(&self) -> Option<TaskId> {
        self.causation.caused_by()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task {} failed: {}\n    caused by {}",
            self.kind, self.task_id, self.error, self.causation
        )
    }
}

/// Receives every caught task failure.
pub trait DiagnosticSink {
    fn report(&self, failure: TaskFailure);
}

/// Default sink: one `tracing` error event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, failure: TaskFailure) {
        tracing::error!(
            task_id = %failure.task_id,
            kind = %failure.kind,
            causation = %failure.causation,
            error = %failure.error,
            "task failed"
        );
    }
}

/// Keeps failures in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    records: Rc<RefCell<Vec<TaskFailure>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.records.borrow_mut())
    }

    pub fn with<R>(&self, f: impl FnOnce(&[TaskFailure]) -> R) -> R {
        f(&self.records.borrow())
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, failure: TaskFailure) {
        self.records.borrow_mut().push(failure);
    }
}
