//! Futures driven by the loop.
//!
//! A spawned future is polled inside immediate-class tasks. Its waker is
//! thread-safe and posts a wake request into the loop's inbox, which becomes
//! the next poll task; repeated wakes before that poll collapse into one.

use crate::diagnostics::Causation;
use crate::remote::Envelope;
use crate::task::ActionResult;
use crossbeam_channel::Sender;
use futures::task::ArcWake;
use slotmap::{Key, new_key_type};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

new_key_type! {
    pub(crate) struct FutureKey;
}

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ActionResult>>>;

pub(crate) struct FutureSlot {
    /// Taken out while being polled.
    pub(crate) future: Option<LocalFuture>,
    pub(crate) waker: Arc<InboxWaker>,
    /// Lineage given to every poll task of this future.
    pub(crate) causation: Causation,
}

pub(crate) struct InboxWaker {
    key: u64,
    sender: Sender<Envelope>,
    queued: AtomicBool,
}

impl InboxWaker {
    pub(crate) fn new(key: FutureKey, sender: Sender<Envelope>) -> Arc<Self> {
        Arc::new(Self {
            key: key.data().as_ffi(),
            sender,
            queued: AtomicBool::new(false),
        })
    }

    /// Marks a poll as pending. Returns false if one already was.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl ArcWake for InboxWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.mark_queued() {
            // A closed inbox means the loop is gone along with the future.
            let _ = arc_self.sender.send(Envelope::Wake(arc_self.key));
        }
    }
}

/// Yields back to the loop once, letting every other ready immediate run
/// before the current future continues.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
