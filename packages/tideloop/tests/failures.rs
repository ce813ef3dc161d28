use anyhow::anyhow;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tideloop::{
    CollectingSink, ConfigError, DiagnosticSink, LoopConfig, Scheduler, TaskExecutionError,
    TaskFailure, TaskId, TaskKind, TaskState, VirtualClock,
};

fn id(n: u64) -> TaskId {
    TaskId::from_u64(n)
}

fn out_of_range() {
    panic!("index out of range");
}

/// A sink that fails on every report.
struct ExplodingSink;

impl DiagnosticSink for ExplodingSink {
    fn report(&self, _failure: TaskFailure) {
        panic!("sink exploded");
    }
}

/// Captured state whose destructor panics.
struct Tripwire;

impl Drop for Tripwire {
    fn drop(&mut self) {
        panic!("tripwire dropped");
    }
}

#[test]
fn test_returned_error_does_not_halt_the_loop() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    let after = Rc::new(Cell::new(false));

    let failing = scheduler.schedule_macrotask(|| -> anyhow::Result<()> {
        Err(anyhow!("disk full"))
    });
    {
        let after = after.clone();
        scheduler.schedule_macrotask(move || after.set(true));
    }

    let result = scheduler.run();

    assert!(result.is_drained());
    assert!(after.get());
    assert_eq!(failing.state(), TaskState::Failed);
    assert_eq!(result.stats.failed, 1);
    assert_eq!(result.stats.executed, 2);

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task_id, failing.id());
    assert_eq!(failures[0].kind, TaskKind::Macrotask);
    assert!(matches!(failures[0].error, TaskExecutionError::Returned(_)));
    assert!(failures[0].error.to_string().contains("disk full"));
}

#[test]
fn test_panic_is_caught_at_task_boundary() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    let panicking = scheduler.schedule_immediate(out_of_range);
    {
        let log = log.clone();
        scheduler.schedule_immediate(move || log.borrow_mut().push("next immediate"));
    }
    {
        let log = log.clone();
        scheduler
            .schedule_timer(Duration::ZERO, move || log.borrow_mut().push("timer"))
            .unwrap();
    }

    let result = scheduler.run();

    assert!(result.is_drained());
    assert_eq!(*log.borrow(), vec!["next immediate", "timer"]);
    assert_eq!(panicking.state(), TaskState::Failed);

    sink.with(|failures| {
        assert_eq!(failures.len(), 1);
        match &failures[0].error {
            TaskExecutionError::Panicked(message) => assert_eq!(message, "index out of range"),
            other => panic!("unexpected error: {other}"),
        }
    });
}

#[test]
fn test_failure_carries_causation_chain() {
    let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());

    // #1 macrotask -> #2 immediate -> #3 timer, which fails.
    {
        let sch = scheduler.clone();
        scheduler.schedule_macrotask(move || {
            let inner = sch.clone();
            sch.schedule_immediate(move || {
                inner
                    .schedule_timer(Duration::from_millis(5), || -> anyhow::Result<()> {
                        Err(anyhow!("request timed out"))
                    })
                    .map(|_| ())
            });
        });
    }

    scheduler.run();

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    let failure = &failures[0];
    assert_eq!(failure.task_id, id(3));
    assert_eq!(failure.kind, TaskKind::Timer);
    assert_eq!(failure.caused_by(), Some(id(2)));
    assert_eq!(failure.causation.ancestors(), &[id(2), id(1)]);
    assert_eq!(failure.causation.origin(), Some(id(1)));
    assert!(!failure.causation.is_truncated());

    let rendered = failure.to_string();
    assert!(rendered.starts_with("timer task #3 failed"));
    assert!(rendered.contains("caused by #2 <- #1"));
}

#[test]
fn test_causation_chain_is_bounded_by_config() {
    let config = LoopConfig {
        causation_depth: 2,
        ..LoopConfig::default()
    };
    let scheduler = Rc::new(Scheduler::with_config(VirtualClock::new(), config).unwrap());
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());

    // A chain of five macrotasks; the last one fails.
    fn hop(sch: Rc<Scheduler<VirtualClock>>, remaining: u32) {
        let next = sch.clone();
        sch.schedule_macrotask(move || -> anyhow::Result<()> {
            if remaining == 0 {
                return Err(anyhow!("end of chain"));
            }
            hop(next, remaining - 1);
            Ok(())
        });
    }
    hop(scheduler.clone(), 4);

    scheduler.run();

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    let causation = &failures[0].causation;
    assert_eq!(failures[0].task_id, id(5));
    assert_eq!(causation.ancestors(), &[id(4), id(3)]);
    assert!(causation.is_truncated());
    assert_eq!(causation.to_string(), "#4 <- #3 <- ...");
}

#[test]
fn test_entry_tasks_have_empty_causation() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());

    let handle = scheduler.schedule_immediate(|| Err::<(), _>(std::fmt::Error));
    assert_eq!(handle.caused_by(), None);

    scheduler.run();

    sink.with(|failures| {
        assert_eq!(failures.len(), 1);
        assert!(failures[0].causation.is_empty());
        assert_eq!(failures[0].causation.to_string(), "<entry>");
    });
}

#[test]
fn test_failing_repeating_timer_keeps_firing() {
    let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    let count = Rc::new(Cell::new(0));
    let slot = Rc::new(RefCell::new(None));

    let handle = {
        let (sch, count, slot) = (scheduler.clone(), count.clone(), slot.clone());
        scheduler
            .schedule_repeating(
                Duration::from_millis(10),
                Duration::from_millis(10),
                move || -> anyhow::Result<()> {
                    count.set(count.get() + 1);
                    if count.get() == 3 {
                        if let Some(me) = slot.borrow().as_ref() {
                            sch.cancel(me);
                        }
                    }
                    Err(anyhow!("tick {} failed", count.get()))
                },
            )
            .unwrap()
    };
    *slot.borrow_mut() = Some(handle.clone());

    let result = scheduler.run();

    assert_eq!(count.get(), 3);
    assert_eq!(sink.len(), 3);
    assert_eq!(result.stats.failed, 3);
    assert_eq!(handle.state(), TaskState::Cancelled);
}

#[test]
fn test_zero_causation_depth_is_rejected() {
    let config = LoopConfig {
        causation_depth: 0,
        ..LoopConfig::default()
    };
    let err = Scheduler::with_config(VirtualClock::new(), config)
        .err()
        .expect("config should be rejected");
    assert!(matches!(
        err,
        ConfigError::ZeroValue {
            field: "causation_depth"
        }
    ));
}

#[test]
fn test_default_sink_logs_and_continues() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let scheduler = Scheduler::with_clock(VirtualClock::new());
    scheduler.schedule_macrotask(|| -> anyhow::Result<()> { Err(anyhow!("logged, not fatal")) });
    scheduler.schedule_macrotask(|| ());

    let result = scheduler.run();

    assert!(result.is_drained());
    assert_eq!(result.stats.failed, 1);
    assert_eq!(result.stats.executed, 2);
}

#[test]
fn test_panicking_sink_does_not_wedge_the_loop() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    scheduler.set_diagnostic_sink(ExplodingSink);
    let after = Rc::new(Cell::new(false));

    scheduler.schedule_macrotask(|| -> anyhow::Result<()> { Err(anyhow!("first")) });
    {
        let after = after.clone();
        scheduler.schedule_macrotask(move || after.set(true));
    }

    let first = scheduler.run();

    assert!(first.is_drained());
    assert!(after.get());
    assert_eq!(first.stats.failed, 1);
    assert!(!scheduler.is_running());

    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    scheduler.schedule_macrotask(|| -> anyhow::Result<()> { Err(anyhow!("second")) });

    let second = scheduler.run();

    assert!(second.is_drained());
    assert_eq!(second.stats.executed, 1);
    assert_eq!(sink.len(), 1);
}

#[test]
fn test_panic_releasing_cancelled_repeating_action_is_reported() {
    let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    let slot = Rc::new(RefCell::new(None));

    let handle = {
        let (sch, slot) = (scheduler.clone(), slot.clone());
        let tripwire = Tripwire;
        scheduler
            .schedule_repeating(Duration::from_millis(10), Duration::from_millis(10), move || {
                let _armed = &tripwire;
                if let Some(me) = slot.borrow().as_ref() {
                    sch.cancel(me);
                }
            })
            .unwrap()
    };
    *slot.borrow_mut() = Some(handle.clone());

    let result = scheduler.run();

    assert!(result.is_drained());
    assert_eq!(result.stats.timers_fired, 1);
    assert_eq!(result.stats.failed, 1);
    assert_eq!(handle.state(), TaskState::Cancelled);

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task_id, handle.id());
    match &failures[0].error {
        TaskExecutionError::Panicked(message) => assert_eq!(message, "tripwire dropped"),
        other => panic!("unexpected error: {other}"),
    }
}
