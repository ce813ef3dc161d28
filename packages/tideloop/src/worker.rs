//! Offload pool for CPU-bound work.
//!
//! Jobs run on named OS threads. A job never touches the loop directly: its
//! result travels back through the inbox and is delivered as a macrotask.

use crate::diagnostics::Causation;
use crate::error::SchedulingError;
use crate::task::ActionResult;
use crossbeam_channel::Sender;
use slotmap::new_key_type;
use std::any::Any;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

new_key_type! {
    pub(crate) struct OffloadKey;
}

/// Loop-side half of an offloaded job: the `!Send` continuation waiting for
/// the worker's result.
pub(crate) struct PendingOffload {
    pub(crate) causation: Causation,
    pub(crate) deliver: Box<dyn FnOnce(Box<dyn Any + Send>) -> ActionResult>,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, SchedulingError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("tideloop-worker-{id}"))
                .spawn(move || {
                    // Ends once the pool drops its sender.
                    for job in receiver.iter() {
                        job();
                    }
                })
                .map_err(SchedulingError::WorkerSpawn)?;
            handles.push(handle);
        }

        tracing::debug!(threads, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            // Receivers live as long as the threads, which outlive the sender.
            let _ = sender.send(Box::new(job));
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked outside of a job");
            }
        }
    }
}
