//! The run loop.
//!
//! One tick:
//! 1. drain the immediate queue until it is observably empty,
//! 2. honour a pending `stop()`,
//! 3. pick a due timer, else the front macrotask, else park until the next
//!    timer (or an inbox message), else finish,
//! 4. run exactly one task to completion and go back to 1.
//!
//! Task actions run on the loop's thread with no interleaving. An action that
//! computes for a long time holds up every other task, however overdue.

use crate::config::LoopConfig;
use crate::diagnostics::{Causation, DiagnosticSink, TaskFailure, TracingSink};
use crate::error::{ConfigError, SchedulingError, TaskExecutionError};
use crate::local_future::{FutureKey, FutureSlot, InboxWaker, LocalFuture};
use crate::queue::{ImmediateQueue, MacrotaskQueue};
use crate::remote::{Completion, Envelope, RemoteHandle};
use crate::task::{
    Action, ActionResult, IntoActionResult, Task, TaskHandle, TaskId, TaskKind, TaskState,
};
use crate::time::{Clock, Time, WallClock};
use crate::timer::TimerQueue;
use crate::worker::{OffloadKey, PendingOffload, WorkerPool};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use slotmap::{Key, KeyData, SlotMap};
use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Timer and macrotask queues are empty and no external work is pending.
    Drained,
    /// `stop()` was requested.
    Stopped,
    /// `run()` was called from inside a task action of the same loop.
    AlreadyRunning,
}

/// Counters for a single `run()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Timer or macrotask selections.
    pub ticks: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped_cancelled: u64,
    pub immediates_run: u64,
    pub timers_fired: u64,
    pub macrotasks_run: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub stats: LoopStats,
}

impl RunResult {
    pub fn is_drained(&self) -> bool {
        self.outcome == RunOutcome::Drained
    }

    pub fn is_stopped(&self) -> bool {
        self.outcome == RunOutcome::Stopped
    }
}

enum Step {
    Timer(Rc<Task>, Time),
    Macrotask(Rc<Task>),
    Park(Time),
    AwaitExternal,
    Drained,
}

/// Single-threaded cooperative scheduler.
///
/// Actions usually need to schedule follow-up work, so the scheduler is
/// typically shared with them through an `Rc`:
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::time::Duration;
/// use tideloop::{Scheduler, VirtualClock};
///
/// let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let (l, s) = (log.clone(), scheduler.clone());
/// scheduler
///     .schedule_timer(Duration::ZERO, move || {
///         l.borrow_mut().push("timer");
///         let l = l.clone();
///         s.schedule_immediate(move || l.borrow_mut().push("immediate"));
///     })
///     .unwrap();
///
/// let l = log.clone();
/// scheduler.schedule_immediate(move || l.borrow_mut().push("first"));
///
/// assert!(scheduler.run().is_drained());
/// assert_eq!(*log.borrow(), ["first", "timer", "immediate"]);
/// ```
pub struct Scheduler<C: Clock = WallClock> {
    clock: C,
    config: LoopConfig,
    next_id: Cell<u64>,
    immediates: ImmediateQueue,
    timers: TimerQueue,
    macrotasks: MacrotaskQueue,
    /// Task whose action is executing; parent of anything it schedules.
    current: RefCell<Option<Rc<Task>>>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    stats: RefCell<LoopStats>,
    sink: RefCell<Rc<dyn DiagnosticSink>>,
    inbox_tx: Sender<Envelope>,
    inbox_rx: Receiver<Envelope>,
    /// External operations the loop must wait for.
    outstanding: Cell<usize>,
    futures: RefCell<SlotMap<FutureKey, FutureSlot>>,
    offloads: RefCell<SlotMap<OffloadKey, PendingOffload>>,
    workers: OnceCell<WorkerPool>,
}

impl Scheduler<WallClock> {
    pub fn new() -> Self {
        Self::with_clock(WallClock::new())
    }
}

impl Default for Scheduler<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(clock: C) -> Self {
        Self::build(clock, LoopConfig::default())
    }

    pub fn with_config(clock: C, config: LoopConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(clock, config))
    }

    fn build(clock: C, config: LoopConfig) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        Self {
            clock,
            timers: TimerQueue::new(config.compaction_threshold),
            config,
            next_id: Cell::new(1),
            immediates: ImmediateQueue::default(),
            macrotasks: MacrotaskQueue::default(),
            current: RefCell::new(None),
            running: Cell::new(false),
            stop_requested: Cell::new(false),
            stats: RefCell::new(LoopStats::default()),
            sink: RefCell::new(Rc::new(TracingSink)),
            inbox_tx,
            inbox_rx,
            outstanding: Cell::new(0),
            futures: RefCell::new(SlotMap::with_key()),
            offloads: RefCell::new(SlotMap::with_key()),
            workers: OnceCell::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Replaces the sink receiving task failures (a [`TracingSink`] by default).
    pub fn set_diagnostic_sink(&self, sink: impl DiagnosticSink + 'static) {
        *self.sink.borrow_mut() = Rc::new(sink);
    }

    /// Task whose action is currently executing.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current.borrow().as_ref().map(|task| task.id())
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn pending_immediates(&self) -> usize {
        self.immediates.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn pending_macrotasks(&self) -> usize {
        self.macrotasks.len()
    }

    /// External operations started with [`begin_external`](Self::begin_external)
    /// or [`offload`](Self::offload) that have not reported back yet.
    pub fn pending_external(&self) -> usize {
        self.outstanding.get()
    }

    pub fn is_idle(&self) -> bool {
        self.immediates.is_empty()
            && self.timers.is_empty()
            && self.macrotasks.is_empty()
            && self.outstanding.get() == 0
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub fn schedule_immediate<F, R>(&self, action: F) -> TaskHandle
    where
        F: FnOnce() -> R + 'static,
        R: IntoActionResult,
    {
        let causation = self.child_causation();
        TaskHandle(self.enqueue(TaskKind::Immediate, Action::once(action), None, None, causation))
    }

    /// One-shot timer due `delay` from now.
    pub fn schedule_timer<F, R>(&self, delay: Duration, action: F) -> Result<TaskHandle, SchedulingError>
    where
        F: FnOnce() -> R + 'static,
        R: IntoActionResult,
    {
        self.insert_timer(delay, None, Action::once(action))
    }

    /// Timer first due `delay` from now, then every `period` after the
    /// previous *scheduled* due time, so late firings do not shift later ones.
    pub fn schedule_repeating<F, R>(
        &self,
        delay: Duration,
        period: Duration,
        action: F,
    ) -> Result<TaskHandle, SchedulingError>
    where
        F: FnMut() -> R + 'static,
        R: IntoActionResult,
    {
        if period.is_zero() {
            return Err(SchedulingError::ZeroPeriod);
        }
        self.insert_timer(delay, Some(period), Action::repeating(action))
    }

    pub fn schedule_macrotask<F, R>(&self, action: F) -> TaskHandle
    where
        F: FnOnce() -> R + 'static,
        R: IntoActionResult,
    {
        let causation = self.child_causation();
        TaskHandle(self.enqueue(TaskKind::Macrotask, Action::once(action), None, None, causation))
    }

    /// Cancels a scheduled task.
    ///
    /// Returns `true` only for the call that moved the task out of the
    /// scheduled state. Cancelling a task that already ran, is running, or was
    /// cancelled before returns `false`.
    pub fn cancel(&self, task: &TaskHandle) -> bool {
        let cancelled = task.0.cancel();
        if cancelled && task.kind() == TaskKind::Timer {
            self.timers.note_cancelled();
        }
        tracing::trace!(task_id = %task.id(), cancelled, "cancel requested");
        cancelled
    }

    /// Stops the loop once the current task and the immediates it queued
    /// have finished. The request is consumed by the `run()` that honours it.
    pub fn stop(&self) {
        tracing::debug!(current = ?self.current_task(), "stop requested");
        self.stop_requested.set(true);
    }

    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle::new(self.inbox_tx.clone())
    }

    /// Registers an external operation that keeps `run()` alive until its
    /// [`Completion`] is completed or dropped.
    pub fn begin_external(&self) -> Completion {
        self.outstanding.set(self.outstanding.get() + 1);
        Completion::new(self.inbox_tx.clone(), self.child_causation())
    }

    /// Runs `future` on the loop. Each poll is an immediate-class task; the
    /// first one is queued right away. An `Err` output is reported to the
    /// diagnostic sink.
    ///
    /// A pending future does not keep `run()` alive.
    pub fn spawn_local<Fut>(&self, future: Fut) -> TaskId
    where
        Fut: Future + 'static,
        Fut::Output: IntoActionResult,
    {
        let causation = self.child_causation();
        let future: LocalFuture = Box::pin(async move { future.await.into_action_result() });
        let sender = self.inbox_tx.clone();
        let key = self.futures.borrow_mut().insert_with_key(|key| FutureSlot {
            future: Some(future),
            waker: InboxWaker::new(key, sender),
            causation: causation.clone(),
        });
        self.futures.borrow()[key].waker.mark_queued();
        self.enqueue(TaskKind::Immediate, Action::Poll(key), None, None, causation)
            .id()
    }

    /// Runs `work` on the offload pool and delivers its result to `on_done`
    /// as a macrotask on this loop. Keeps `run()` alive until delivered.
    ///
    /// A panic in `work` is reported as a failure of the delivery task.
    pub fn offload<W, T, D, R>(&self, work: W, on_done: D) -> Result<(), SchedulingError>
    where
        W: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        D: FnOnce(T) -> R + 'static,
        R: IntoActionResult,
    {
        let pool = match self.workers.get() {
            Some(pool) => pool,
            None => {
                let pool = WorkerPool::new(self.config.worker_threads)?;
                self.workers.get_or_init(|| pool)
            }
        };

        let deliver = Box::new(move |value: Box<dyn Any + Send>| -> ActionResult {
            match value.downcast::<T>() {
                Ok(value) => on_done(*value).into_action_result(),
                Err(_) => Err(anyhow::anyhow!("offloaded work produced an unexpected type")),
            }
        });
        let key = self.offloads.borrow_mut().insert(PendingOffload {
            causation: self.child_causation(),
            deliver,
        });
        self.outstanding.set(self.outstanding.get() + 1);

        let sender = self.inbox_tx.clone();
        let raw = key.data().as_ffi();
        pool.execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                .map(|value| Box::new(value) as Box<dyn Any + Send>)
                .map_err(|payload| crate::error::panic_message(payload.as_ref()));
            let _ = sender.send(Envelope::Offloaded { key: raw, outcome });
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Drives the loop until the timer and macrotask queues are empty (and no
    /// external operation is pending), or until `stop()` is honoured.
    pub fn run(&self) -> RunResult {
        if self.running.replace(true) {
            tracing::warn!(current = ?self.current_task(), "run() re-entered from a task action");
            return RunResult {
                outcome: RunOutcome::AlreadyRunning,
                stats: LoopStats::default(),
            };
        }

        let span = tracing::debug_span!("event_loop", name = %self.config.name);
        let _enter = span.enter();
        tracing::debug!(
            immediates = self.immediates.len(),
            timers = self.timers.len(),
            macrotasks = self.macrotasks.len(),
            "run started"
        );
        self.stats.replace(LoopStats::default());
        let _running = RunningGuard(&self.running);

        let outcome = loop {
            self.settle();

            if self.stop_requested.replace(false) {
                break RunOutcome::Stopped;
            }

            match self.next_step() {
                Step::Timer(task, due) => {
                    self.stats.borrow_mut().ticks += 1;
                    self.fire_timer(task, due);
                }
                Step::Macrotask(task) => {
                    self.stats.borrow_mut().ticks += 1;
                    self.execute(task, false);
                }
                Step::Park(deadline) => self.park(deadline),
                Step::AwaitExternal => self.await_external(),
                Step::Drained => break RunOutcome::Drained,
            }
        };

        let stats = self.stats.take();
        tracing::debug!(
            ?outcome,
            ticks = stats.ticks,
            executed = stats.executed,
            failed = stats.failed,
            "run finished"
        );
        RunResult { outcome, stats }
    }

    /// Drains immediates, pulling in inbox messages until neither produces
    /// more immediate work.
    fn settle(&self) {
        loop {
            self.immediates.drain_with(|task| self.execute(task, false));
            if !self.absorb_inbox() || self.immediates.is_empty() {
                break;
            }
        }
    }

    fn next_step(&self) -> Step {
        let now = self.clock.now();
        if let Some((task, due)) = self.timers.pop_due(now) {
            return Step::Timer(task, due);
        }
        if let Some(task) = self.macrotasks.pop_front() {
            return Step::Macrotask(task);
        }
        if let Some(deadline) = self.timers.next_due() {
            return Step::Park(deadline);
        }
        if self.outstanding.get() > 0 {
            return Step::AwaitExternal;
        }
        Step::Drained
    }

    fn park(&self, deadline: Time) {
        let Some(wait) = self.clock.park_for(deadline) else {
            return;
        };
        if wait.is_zero() {
            return;
        }
        tracing::trace!(%deadline, ?wait, "parking until next timer");
        match self.inbox_rx.recv_timeout(wait) {
            Ok(envelope) => self.accept(envelope),
            // The loop holds a sender itself, so the inbox never disconnects.
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
    }

    fn await_external(&self) {
        tracing::debug!(outstanding = self.outstanding.get(), "waiting for external completions");
        if let Ok(envelope) = self.inbox_rx.recv() {
            self.accept(envelope);
        }
    }

    fn absorb_inbox(&self) -> bool {
        let mut absorbed = false;
        while let Ok(envelope) = self.inbox_rx.try_recv() {
            self.accept(envelope);
            absorbed = true;
        }
        absorbed
    }

    fn accept(&self, envelope: Envelope) {
        match envelope {
            Envelope::Macrotask {
                action,
                causation,
                settles,
            } => {
                if settles {
                    self.settle_external();
                }
                let action: Box<dyn FnOnce() -> ActionResult> = action;
                self.enqueue(TaskKind::Macrotask, Action::Once(action), None, None, causation);
            }
            Envelope::Abandoned { causation } => {
                self.settle_external();
                tracing::warn!(%causation, "external operation dropped without completing");
            }
            Envelope::Offloaded { key, outcome } => {
                self.settle_external();
                self.deliver_offload(key, outcome);
            }
            Envelope::Wake(raw) => self.wake_future(raw),
            Envelope::Stop => self.stop(),
        }
    }

    fn settle_external(&self) {
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
    }

    fn deliver_offload(&self, raw: u64, outcome: Result<Box<dyn Any + Send>, String>) {
        let key = OffloadKey::from(KeyData::from_ffi(raw));
        let Some(pending) = self.offloads.borrow_mut().remove(key) else {
            return;
        };
        let deliver = pending.deliver;
        let action: Box<dyn FnOnce() -> ActionResult> = match outcome {
            Ok(value) => Box::new(move || deliver(value)),
            Err(message) => Box::new(move || Err(anyhow::anyhow!("offloaded work panicked: {message}"))),
        };
        self.enqueue(TaskKind::Macrotask, Action::Once(action), None, None, pending.causation);
    }

    fn wake_future(&self, raw: u64) {
        let key = FutureKey::from(KeyData::from_ffi(raw));
        let causation = match self.futures.borrow().get(key) {
            Some(slot) => slot.causation.clone(),
            None => return,
        };
        self.enqueue(TaskKind::Immediate, Action::Poll(key), None, None, causation);
    }

    fn poll_future(&self, key: FutureKey) -> ActionResult {
        let (mut future, waker) = {
            let mut futures = self.futures.borrow_mut();
            let Some(slot) = futures.get_mut(key) else {
                return Ok(());
            };
            let Some(future) = slot.future.take() else {
                return Ok(());
            };
            (future, slot.waker.clone())
        };

        waker.clear_queued();
        let waker = futures::task::waker(waker);
        let mut cx = Context::from_waker(&waker);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(result) => {
                self.futures.borrow_mut().remove(key);
                result
            }
            Poll::Pending => {
                if let Some(slot) = self.futures.borrow_mut().get_mut(key) {
                    slot.future = Some(future);
                }
                Ok(())
            }
        }
    }

    fn fire_timer(&self, task: Rc<Task>, due: Time) {
        // Re-arm from the scheduled due time, not from now, so a late firing
        // does not push every later one back.
        let rearmed = match task.period() {
            Some(period) => match due.checked_add(period) {
                Some(next) => {
                    task.set_due(next);
                    self.timers.push(task.clone());
                    true
                }
                None => {
                    tracing::warn!(task_id = %task.id(), "repeating timer ran out of clock range; firing for the last time");
                    false
                }
            },
            None => false,
        };
        self.execute(task, rearmed);
    }

    /// Runs one task's action at the task boundary: failures are caught and
    /// reported, never propagated.
    fn execute(&self, task: Rc<Task>, rearmed: bool) {
        if task.is_cancelled() {
            self.stats.borrow_mut().skipped_cancelled += 1;
            tracing::trace!(task_id = %task.id(), "skipping cancelled task");
            return;
        }
        let Some(action) = task.take_action() else {
            return;
        };
        if !rearmed {
            task.set_state(TaskState::Running);
        }
        tracing::trace!(task_id = %task.id(), kind = %task.kind(), "running task");

        let previous = self.current.replace(Some(task.clone()));
        let (result, leftover) = match action {
            Action::Once(action) => (invoke(action), None),
            Action::Repeating(mut action) => {
                let result = invoke(&mut action);
                if task.state() == TaskState::Scheduled {
                    (result, Some(action))
                } else {
                    // Cancelled from inside its own action: the next firing is
                    // a tombstone, so captured state is released here.
                    let released = invoke(move || {
                        drop(action);
                        Ok(())
                    });
                    (result.and(released), None)
                }
            }
            Action::Poll(key) => {
                let result = invoke(|| self.poll_future(key));
                if result.is_err() {
                    self.futures.borrow_mut().remove(key);
                }
                (result, None)
            }
        };
        self.current.replace(previous);

        {
            let mut stats = self.stats.borrow_mut();
            stats.executed += 1;
            match task.kind() {
                TaskKind::Immediate => stats.immediates_run += 1,
                TaskKind::Timer => stats.timers_fired += 1,
                TaskKind::Macrotask => stats.macrotasks_run += 1,
            }
            if result.is_err() {
                stats.failed += 1;
            }
        }

        match result {
            Ok(()) if !rearmed => task.set_state(TaskState::Executed),
            Ok(()) => {}
            Err(error) => {
                if !rearmed {
                    task.set_state(TaskState::Failed);
                }
                self.report(&task, error);
            }
        }

        if let Some(action) = leftover {
            task.restore_action(Action::Repeating(action));
        }
    }

    fn report(&self, task: &Task, error: TaskExecutionError) {
        let failure = TaskFailure {
            task_id: task.id(),
            kind: task.kind(),
            causation: task.causation().clone(),
            error,
        };
        let task_id = failure.task_id;
        let sink = Rc::clone(&*self.sink.borrow());
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.report(failure))) {
            tracing::error!(
                %task_id,
                panic = %crate::error::panic_message(payload.as_ref()),
                "diagnostic sink panicked while reporting a task failure"
            );
        }
    }

    // ------------------------------------------------------------------
    // Task bookkeeping
    // ------------------------------------------------------------------

    fn insert_timer(
        &self,
        delay: Duration,
        period: Option<Duration>,
        action: Action,
    ) -> Result<TaskHandle, SchedulingError> {
        let now = self.clock.now();
        let due = now
            .checked_add(delay)
            .ok_or(SchedulingError::DeadlineOverflow { now, delay })?;
        let causation = self.child_causation();
        Ok(TaskHandle(self.enqueue(
            TaskKind::Timer,
            action,
            Some(due),
            period,
            causation,
        )))
    }

    fn child_causation(&self) -> Causation {
        match &*self.current.borrow() {
            Some(parent) => {
                Causation::child_of(parent.id(), parent.causation(), self.config.causation_depth)
            }
            None => Causation::default(),
        }
    }

    fn next_task_id(&self) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        TaskId::from_u64(id)
    }

    fn enqueue(
        &self,
        kind: TaskKind,
        action: Action,
        due: Option<Time>,
        period: Option<Duration>,
        causation: Causation,
    ) -> Rc<Task> {
        let task = Rc::new(Task::new(
            self.next_task_id(),
            kind,
            action,
            due,
            period,
            causation,
        ));
        tracing::trace!(
            task_id = %task.id(),
            %kind,
            due_ms = due.map(Time::as_millis),
            caused_by = ?task.causation().caused_by(),
            "task scheduled"
        );
        match kind {
            TaskKind::Immediate => self.immediates.push(task.clone()),
            TaskKind::Timer => self.timers.push(task.clone()),
            TaskKind::Macrotask => self.macrotasks.push(task.clone()),
        }
        task
    }
}

/// Clears the running flag however `run()` is left.
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn invoke<F>(action: F) -> Result<(), TaskExecutionError>
where
    F: FnOnce() -> ActionResult,
{
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(TaskExecutionError::Returned(error)),
        Err(payload) => Err(TaskExecutionError::from_panic(payload)),
    }
}
