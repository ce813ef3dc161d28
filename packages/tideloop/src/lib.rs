//! Tideloop: a single-threaded, cooperative event loop.
//!
//! Work is submitted as tasks of three priority classes:
//! - **immediates** run before anything else and are drained to empty after
//!   every single task,
//! - **timers** become runnable at an absolute due time and may repeat,
//! - **macrotasks** carry completed external work in arrival order.
//!
//! Due timers win over macrotasks. Every action runs to completion before the
//! next one starts; nothing is preempted.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod local_future;
mod queue;
pub mod remote;
pub mod scheduler;
pub mod task;
pub mod time;
mod timer;
pub mod worker;

pub use config::LoopConfig;
pub use diagnostics::{Causation, CollectingSink, DiagnosticSink, TaskFailure, TracingSink};
pub use error::{ConfigError, SchedulingError, TaskExecutionError};
pub use local_future::{YieldNow, yield_now};
pub use remote::{Completion, RemoteHandle};
pub use scheduler::{LoopStats, RunOutcome, RunResult, Scheduler};
pub use task::{ActionResult, IntoActionResult, TaskHandle, TaskId, TaskKind, TaskState};
pub use time::{Clock, Time, VirtualClock, WallClock};
pub use worker::WorkerPool;
