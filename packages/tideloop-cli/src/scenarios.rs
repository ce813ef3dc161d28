//! Demonstration scenarios. Each one queues its work on the scheduler and
//! prints what happens synchronously; `main` then drives the loop.

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use std::cell::{Cell, RefCell};
use std::hint::black_box;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tideloop::{Clock, DiagnosticSink, Scheduler, TaskFailure, TaskHandle, yield_now};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Immediates scheduled around a zero-delay timer all run first
    NextTick,
    /// A synchronous busy loop holds up an already-due timer
    Blocking {
        /// How long the busy loop keeps the thread occupied
        #[arg(long, default_value_t = 1000)]
        busy_ms: u64,
    },
    /// A timer completes after the synchronous code has moved on
    NonBlocking {
        #[arg(long, default_value_t = 2000)]
        delay_ms: u64,
    },
    /// Builds a greeting on a worker thread and prints it on the loop
    Worker {
        #[arg(long, default_value = "User")]
        name: String,
    },
    /// An error raised two awaits deep, reported with its task lineage
    AsyncTrace,
    /// A repeating timer that cancels itself after `count` ticks
    Interval {
        #[arg(long, default_value_t = 250)]
        period_ms: u64,
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },
}

/// Output lines of a scenario, optionally echoed to stdout.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Rc<RefCell<Vec<String>>>,
    echo: bool,
}

impl Transcript {
    pub fn stdout() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn say(&self, line: impl Into<String>) {
        let line = line.into();
        if self.echo {
            println!("{line}");
        }
        self.lines.borrow_mut().push(line);
    }

    #[cfg(test)]
    fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

/// Prints task failures into the transcript.
struct TranscriptSink {
    out: Transcript,
}

impl DiagnosticSink for TranscriptSink {
    fn report(&self, failure: TaskFailure) {
        tracing::debug!(task_id = %failure.task_id, "task failure printed");
        self.out.say(failure.to_string());
    }
}

pub fn prepare<C>(scenario: &Scenario, scheduler: &Rc<Scheduler<C>>, out: &Transcript) -> Result<()>
where
    C: Clock + Clone + 'static,
{
    match scenario {
        Scenario::NextTick => next_tick(scheduler, out),
        Scenario::Blocking { busy_ms } => blocking(scheduler, out, Duration::from_millis(*busy_ms)),
        Scenario::NonBlocking { delay_ms } => {
            non_blocking(scheduler, out, Duration::from_millis(*delay_ms))
        }
        Scenario::Worker { name } => worker(scheduler, out, name),
        Scenario::AsyncTrace => async_trace(scheduler, out),
        Scenario::Interval { period_ms, count } => {
            interval(scheduler, out, Duration::from_millis(*period_ms), *count)
        }
    }
}

fn next_tick<C: Clock>(scheduler: &Scheduler<C>, out: &Transcript) -> Result<()> {
    out.say("Start");

    let o = out.clone();
    scheduler.schedule_immediate(move || o.say("Immediate callback #1"));
    let o = out.clone();
    scheduler.schedule_timer(Duration::ZERO, move || o.say("Timer #1 callback"))?;
    let o = out.clone();
    scheduler.schedule_immediate(move || o.say("Immediate callback #2"));

    out.say("End");
    Ok(())
}

fn blocking<C: Clock + Clone + 'static>(
    scheduler: &Scheduler<C>,
    out: &Transcript,
    busy: Duration,
) -> Result<()> {
    out.say("Before blocking operation");

    let due = scheduler.now();
    let (o, clock) = (out.clone(), scheduler.clock().clone());
    scheduler.schedule_timer(Duration::ZERO, move || {
        let late = clock.now().saturating_duration_since(due);
        o.say(format!("Zero-delay timer ran {}ms late", late.as_millis()));
    })?;

    blocking_operation(out, busy);
    out.say("After blocking operation");
    Ok(())
}

fn blocking_operation(out: &Transcript, busy: Duration) {
    out.say("Start blocking operation");
    let started = Instant::now();
    let mut iterations = 0u64;
    while started.elapsed() < busy {
        iterations = black_box(iterations + 1);
    }
    tracing::debug!(iterations, "busy loop finished");
    out.say("End blocking operation");
}

fn non_blocking<C: Clock>(scheduler: &Scheduler<C>, out: &Transcript, delay: Duration) -> Result<()> {
    out.say("Before non-blocking operation");
    let o = out.clone();
    scheduler.schedule_timer(delay, move || o.say("Non-blocking operation completed"))?;
    out.say("After non-blocking operation");
    Ok(())
}

fn worker<C: Clock>(scheduler: &Scheduler<C>, out: &Transcript, name: &str) -> Result<()> {
    let name = name.to_owned();
    let o = out.clone();
    scheduler.offload(
        move || {
            tracing::debug!(thread = ?thread::current().name(), "building greeting");
            format!("Hello {name}!")
        },
        move |greeting: String| o.say(greeting),
    )?;
    Ok(())
}

async fn bar() -> Result<()> {
    yield_now().await;
    Err(anyhow!("Fail"))
}

async fn foo() -> Result<()> {
    bar().await.context("foo awaited bar")
}

fn async_trace<C: Clock + 'static>(scheduler: &Rc<Scheduler<C>>, out: &Transcript) -> Result<()> {
    scheduler.set_diagnostic_sink(TranscriptSink { out: out.clone() });

    let (sch, o) = (scheduler.clone(), out.clone());
    scheduler.schedule_macrotask(move || {
        sch.spawn_local(async move {
            foo().await?;
            o.say("success");
            Ok::<(), anyhow::Error>(())
        });
    });
    Ok(())
}

fn interval<C: Clock + Clone + 'static>(
    scheduler: &Rc<Scheduler<C>>,
    out: &Transcript,
    period: Duration,
    count: u32,
) -> Result<()> {
    let started = scheduler.now();
    let slot: Rc<RefCell<Option<TaskHandle>>> = Rc::default();
    let fired = Cell::new(0u32);

    let handle = {
        let (sch, o, slot) = (scheduler.clone(), out.clone(), slot.clone());
        let clock = scheduler.clock().clone();
        scheduler.schedule_repeating(period, period, move || {
            let n = fired.get() + 1;
            fired.set(n);
            let elapsed = clock.now().saturating_duration_since(started);
            o.say(format!("Tick {n} at +{}ms", elapsed.as_millis()));
            if n >= count {
                // Dropping the action also drops this slot, breaking the cycle.
                if let Some(me) = slot.borrow().as_ref() {
                    sch.cancel(me);
                }
                o.say(format!("Interval cancelled after {n} ticks"));
            }
        })?
    };
    *slot.borrow_mut() = Some(handle);
    Ok(())
}
