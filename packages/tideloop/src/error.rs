use crate::time::Time;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid scheduling request, rejected synchronously at the call site.
///
/// The loop's queues are untouched when one of these is returned, and they
/// never reach the diagnostic sink.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("repeating timer period must be non-zero")]
    ZeroPeriod,

    #[error("timer deadline overflows the clock range (now {now}, delay {delay:?})")]
    DeadlineOverflow { now: Time, delay: Duration },

    #[error("event loop has been dropped")]
    LoopClosed,

    #[error("failed to start worker thread")]
    WorkerSpawn(#[source] std::io::Error),
}

/// A task action failed. Caught at the task boundary; never fatal to the loop.
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("action returned an error: {0:#}")]
    Returned(anyhow::Error),

    #[error("action panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed loop configuration")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{field}` must be at least 1")]
    ZeroValue { field: &'static str },
}

impl TaskExecutionError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        TaskExecutionError::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
