//! Handing work back to the loop from other threads.
//!
//! The scheduler itself is `!Send`. Anything running elsewhere (a worker
//! thread, an OS callback, a blocking driver) talks to it only by posting an
//! envelope into its inbox; the loop turns each posted completion into an
//! ordinary macrotask in arrival order.

use crate::diagnostics::Causation;
use crate::error::SchedulingError;
use crate::task::{ActionResult, IntoActionResult, TaskId};
use crossbeam_channel::Sender;
use std::any::Any;
use std::fmt;

pub(crate) type SendAction = Box<dyn FnOnce() -> ActionResult + Send>;

pub(crate) enum Envelope {
    Macrotask {
        action: SendAction,
        causation: Causation,
        /// Settles one outstanding external operation.
        settles: bool,
    },
    /// A [`Completion`] was dropped without being completed.
    Abandoned { causation: Causation },
    /// Result of work run on the offload pool.
    Offloaded {
        key: u64,
        outcome: Result<Box<dyn Any + Send>, String>,
    },
    /// A spawned future asked to be polled again.
    Wake(u64),
    Stop,
}

fn boxed<F, R>(action: F) -> SendAction
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoActionResult,
{
    Box::new(move || action().into_action_result())
}

/// Thread-safe handle for posting macrotasks and stop requests to a loop.
///
/// Posting through a `RemoteHandle` does not keep `run()` alive on its own;
/// use [`Completion`] for operations the loop must wait for.
#[derive(Clone)]
pub struct RemoteHandle {
    sender: Sender<Envelope>,
}

impl RemoteHandle {
    pub(crate) fn new(sender: Sender<Envelope>) -> Self {
        Self { sender }
    }

    pub fn schedule_macrotask<F, R>(&self, action: F) -> Result<(), SchedulingError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoActionResult,
    {
        self.post(Envelope::Macrotask {
            action: boxed(action),
            causation: Causation::default(),
            settles: false,
        })
    }

    /// Asks the loop to stop at its next checkpoint.
    pub fn stop(&self) -> Result<(), SchedulingError> {
        self.post(Envelope::Stop)
    }

    fn post(&self, envelope: Envelope) -> Result<(), SchedulingError> {
        self.sender
            .send(envelope)
            .map_err(|_| SchedulingError::LoopClosed)
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}

/// One pending external operation.
///
/// While any `Completion` is outstanding, `run()` parks on the inbox instead
/// of returning. [`complete`](Completion::complete) hands in exactly one
/// macrotask; dropping the token instead releases the loop without one.
#[must_use = "dropping a Completion abandons the external operation"]
pub struct Completion {
    sender: Sender<Envelope>,
    causation: Causation,
    settled: bool,
}

impl Completion {
    pub(crate) fn new(sender: Sender<Envelope>, causation: Causation) -> Self {
        Self {
            sender,
            causation,
            settled: false,
        }
    }

    /// Delivers the operation's result as a macrotask on the loop.
    pub fn complete<F, R>(mut self, action: F) -> Result<(), SchedulingError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoActionResult,
    {
        self.settled = true;
        let envelope = Envelope::Macrotask {
            action: boxed(action),
            causation: std::mem::take(&mut self.causation),
            settles: true,
        };
        self.sender
            .send(envelope)
            .map_err(|_| SchedulingError::LoopClosed)
    }

    /// Task that started this operation, if any.
    pub fn caused_by(&self) -> Option<TaskId> {
        self.causation.caused_by()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.settled {
            let causation = std::mem::take(&mut self.causation);
            // Nothing to release if the loop is already gone.
            let _ = self.sender.send(Envelope::Abandoned { causation });
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("caused_by", &self.causation.caused_by())
            .field("settled", &self.settled)
            .finish()
    }
}
