//! Cross-thread completion posting.
//!
//! The loop itself is single-threaded. Other threads hand work to it through
//! a [`Remote`]: jobs go into a lock-free queue and a parked loop is woken
//! through a mutex/condvar pair. Jobs run on the loop thread in the drain
//! phase of the iteration that observes them.

use super::driver::Completion;
use crate::error::{Error, ErrorKind, Result};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type RemoteJob = Box<dyn FnOnce() + Send>;

pub(crate) struct RemoteQueue {
    jobs: SegQueue<RemoteJob>,
    woken: Mutex<bool>,
    wakeup: Condvar,
    closed: AtomicBool,
}

impl RemoteQueue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: SegQueue::new(),
            woken: Mutex::new(false),
            wakeup: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, job: RemoteJob) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::LoopGone).with_message("event loop was dropped"));
        }
        self.jobs.push(job);
        self.wake();
        Ok(())
    }

    pub(crate) fn wake(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wakeup.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Completion> {
        self.jobs.pop().map(|job| job as Completion)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Parks the calling (loop) thread until woken or until `timeout`
    /// elapses. `None` waits indefinitely.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let mut woken = self.woken.lock();
        if !*woken && self.jobs.is_empty() {
            match timeout {
                Some(timeout) => {
                    let _ = self.wakeup.wait_for(&mut woken, timeout);
                }
                None => self.wakeup.wait(&mut woken),
            }
        }
        *woken = false;
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.jobs.pop().is_some() {}
    }
}

/// A `Send + Sync` handle for posting completions to a loop from any thread.
///
/// # Example
///
/// ```
/// use tickslot::event_loop::{EventLoop, RunMode};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let event_loop = EventLoop::new();
/// let remote = event_loop.remote();
/// let ran = Arc::new(AtomicBool::new(false));
///
/// let flag = ran.clone();
/// std::thread::spawn(move || {
///     remote.post(move || flag.store(true, Ordering::SeqCst)).unwrap();
/// })
/// .join()
/// .unwrap();
///
/// event_loop.run(RunMode::Default);
/// assert!(ran.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct Remote {
    queue: Arc<RemoteQueue>,
}

impl Remote {
    pub(crate) fn new(queue: Arc<RemoteQueue>) -> Self {
        Self { queue }
    }

    /// Queues `job` to run on the loop thread and wakes the loop.
    ///
    /// # Errors
    ///
    /// Returns `LoopGone` if the loop has been dropped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.queue.push(Box::new(job))
    }

    /// Wakes a blocked loop without queueing work.
    pub fn wake(&self) {
        self.queue.wake();
    }

    /// Returns true if the loop behind this remote has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("pending", &self.queue.jobs.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
