use anyhow::anyhow;
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tideloop::{
    Clock, CollectingSink, Scheduler, TaskExecutionError, TaskKind, VirtualClock, yield_now,
};

#[test]
fn test_spawned_future_runs_to_completion() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let done = Rc::new(Cell::new(false));

    {
        let done = done.clone();
        scheduler.spawn_local(async move {
            done.set(true);
        });
    }
    assert_eq!(scheduler.pending_immediates(), 1);

    let result = scheduler.run();

    assert!(result.is_drained());
    assert!(done.get());
    assert_eq!(result.stats.immediates_run, 1);
}

#[test]
fn test_yield_now_lets_other_immediates_run() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        scheduler.spawn_local(async move {
            log.borrow_mut().push("a1");
            yield_now().await;
            log.borrow_mut().push("a2");
        });
    }
    {
        let log = log.clone();
        scheduler.schedule_immediate(move || log.borrow_mut().push("b"));
    }
    {
        let log = log.clone();
        scheduler.schedule_macrotask(move || log.borrow_mut().push("macro"));
    }

    scheduler.run();

    // The resumed future is still immediate-class, so it beats the macrotask.
    assert_eq!(*log.borrow(), vec!["a1", "b", "a2", "macro"]);
}

#[test]
fn test_future_woken_by_timer() {
    let clock = VirtualClock::new();
    let scheduler = Rc::new(Scheduler::with_clock(clock.clone()));
    let received = Rc::new(Cell::new(None));

    let (tx, rx) = oneshot::channel::<&'static str>();
    scheduler
        .schedule_timer(Duration::from_millis(50), move || {
            let _ = tx.send("pong");
        })
        .unwrap();

    {
        let (received, clock) = (received.clone(), clock.clone());
        scheduler.spawn_local(async move {
            let reply = rx.await?;
            received.set(Some((reply, clock.now().as_millis())));
            Ok::<(), oneshot::Canceled>(())
        });
    }

    let result = scheduler.run();

    assert!(result.is_drained());
    assert_eq!(received.get(), Some(("pong", 50)));
}

#[test]
fn test_pending_future_does_not_keep_loop_alive() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let finished = Rc::new(Cell::new(false));
    let (_tx, rx) = oneshot::channel::<()>();

    {
        let finished = finished.clone();
        scheduler.spawn_local(async move {
            let _ = rx.await;
            finished.set(true);
        });
    }

    let result = scheduler.run();

    assert!(result.is_drained());
    assert!(!finished.get());
}

#[test]
fn test_future_error_is_reported_with_causation() {
    let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());

    let parent = {
        let sch = scheduler.clone();
        scheduler.schedule_macrotask(move || {
            sch.spawn_local(async {
                yield_now().await;
                Err::<(), _>(anyhow!("handshake failed"))
            });
        })
    };

    scheduler.run();

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, TaskKind::Immediate);
    assert_eq!(failures[0].caused_by(), Some(parent.id()));
    assert!(failures[0].error.to_string().contains("handshake failed"));
}

#[test]
fn test_panicking_future_is_dropped() {
    let scheduler = Scheduler::with_clock(VirtualClock::new());
    let sink = CollectingSink::new();
    scheduler.set_diagnostic_sink(sink.clone());
    let polls = Rc::new(Cell::new(0));

    {
        let polls = polls.clone();
        scheduler.spawn_local(async move {
            polls.set(polls.get() + 1);
            yield_now().await;
            polls.set(polls.get() + 1);
            if polls.get() == 2 {
                panic!("bad state");
            }
        });
    }

    let result = scheduler.run();

    assert!(result.is_drained());
    assert_eq!(polls.get(), 2);
    sink.with(|failures| {
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, TaskExecutionError::Panicked(_)));
    });
}

#[test]
fn test_futures_spawned_from_futures() {
    let scheduler = Rc::new(Scheduler::with_clock(VirtualClock::new()));
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let (sch, log) = (scheduler.clone(), log.clone());
        scheduler.spawn_local(async move {
            log.borrow_mut().push("outer start");
            let inner_log = log.clone();
            sch.spawn_local(async move {
                inner_log.borrow_mut().push("inner");
            });
            yield_now().await;
            log.borrow_mut().push("outer end");
        });
    }

    scheduler.run();

    assert_eq!(*log.borrow(), vec!["outer start", "inner", "outer end"]);
}
