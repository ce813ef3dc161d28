//! Task records and their public handles.

use crate::diagnostics::Causation;
use crate::local_future::FutureKey;
use crate::time::Time;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Sequence number assigned at creation; strictly increasing per scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which queue a task belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Drained to empty after every single task execution.
    Immediate,
    /// Runnable once its due time has passed.
    Timer,
    /// Completed external work or deferred later-phase work.
    Macrotask,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Immediate => "immediate",
            TaskKind::Timer => "timer",
            TaskKind::Macrotask => "macrotask",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in a queue. A repeating timer returns here before each firing.
    Scheduled,
    /// Action currently executing.
    Running,
    /// Action returned successfully.
    Executed,
    /// Action returned an error or panicked.
    Failed,
    /// Cancelled before it could run; the action will never execute.
    Cancelled,
}

/// What task actions return.
pub type ActionResult = anyhow::Result<()>;

/// Return types accepted from task actions: `()` or `Result<(), E>`.
pub trait IntoActionResult {
    fn into_action_result(self) -> ActionResult;
}

impl IntoActionResult for () {
    fn into_action_result(self) -> ActionResult {
        Ok(())
    }
}

impl<E> IntoActionResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_action_result(self) -> ActionResult {
        self.map_err(Into::into)
    }
}

pub(crate) enum Action {
    Once(Box<dyn FnOnce() -> ActionResult>),
    Repeating(Box<dyn FnMut() -> ActionResult>),
    /// Poll a future owned by the scheduler.
    Poll(FutureKey),
}

impl Action {
    pub(crate) fn once<F, R>(action: F) -> Self
    where
        F: FnOnce() -> R + 'static,
        R: IntoActionResult,
    {
        Action::Once(Box::new(move || action().into_action_result()))
    }

    pub(crate) fn repeating<F, R>(mut action: F) -> Self
    where
        F: FnMut() -> R + 'static,
        R: IntoActionResult,
    {
        Action::Repeating(Box::new(move || action().into_action_result()))
    }
}

/// A unit of deferred work. Lives in exactly one queue until it runs or is
/// cancelled.
pub(crate) struct Task {
    id: TaskId,
    kind: TaskKind,
    state: Cell<TaskState>,
    due: Cell<Option<Time>>,
    period: Option<Duration>,
    causation: Causation,
    action: RefCell<Option<Action>>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        kind: TaskKind,
        action: Action,
        due: Option<Time>,
        period: Option<Duration>,
        causation: Causation,
    ) -> Self {
        Self {
            id,
            kind,
            state: Cell::new(TaskState::Scheduled),
            due: Cell::new(due),
            period,
            causation,
            action: RefCell::new(Some(action)),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn due(&self) -> Option<Time> {
        self.due.get()
    }

    pub(crate) fn set_due(&self, due: Time) {
        self.due.set(Some(due));
    }

    pub(crate) fn period(&self) -> Option<Duration> {
        self.period
    }

    pub(crate) fn causation(&self) -> &Causation {
        &self.causation
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.get() == TaskState::Cancelled
    }

    /// Scheduled -> Cancelled. Any other state is left alone.
    pub(crate) fn cancel(&self) -> bool {
        if self.state.get() != TaskState::Scheduled {
            return false;
        }
        self.state.set(TaskState::Cancelled);
        // Release captured state now; the queue entry may linger as a tombstone.
        // A repeating action that is executing right now is not in the cell.
        let released = self.action.borrow_mut().take();
        drop(released);
        true
    }

    pub(crate) fn take_action(&self) -> Option<Action> {
        self.action.borrow_mut().take()
    }

    pub(crate) fn restore_action(&self, action: Action) {
        *self.action.borrow_mut() = Some(action);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .field("due", &self.due.get())
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a scheduled task, used for inspection and cancellation.
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Rc<Task>);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    pub fn kind(&self) -> TaskKind {
        self.0.kind()
    }

    pub fn state(&self) -> TaskState {
        self.0.state()
    }

    /// Absolute due time of the next firing. `None` unless this is a timer.
    pub fn due_time(&self) -> Option<Time> {
        self.0.due()
    }

    pub fn period(&self) -> Option<Duration> {
        self.0.period()
    }

    pub fn caused_by(&self) -> Option<TaskId> {
        self.0.causation().caused_by()
    }

    pub fn causation(&self) -> &Causation {
        self.0.causation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}
