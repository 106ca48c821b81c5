//! Single-threaded host event loop.
//!
//! The loop runs in phases. Each iteration:
//!
//! 1. update the cached loop time
//! 2. **timers**: fire every countdown timer whose deadline has passed
//! 3. **idle**: run active idle markers
//! 4. **poll / drain**: block for completions (not at all while an idle
//!    marker is active), then run every ready completion
//! 5. **check**: run active drain-phase markers
//! 6. **close**: run close completions that are due
//!
//! Two clock modes are available. [`EventLoop::new`] uses the wall clock and
//! parks the thread while blocking. [`EventLoop::lab`] uses a
//! [`VirtualClock`]: instead of sleeping, the poll phase jumps virtual time
//! to the next timer deadline or deferred completion, and close completions
//! are reordered (and optionally deferred) by a seeded RNG.
//!
//! # Example
//!
//! ```
//! use tickslot::event_loop::{EventLoop, LabConfig, RunMode, TimerHandle};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let event_loop = EventLoop::lab(LabConfig::new(1));
//! let fired = Rc::new(Cell::new(false));
//! let flag = fired.clone();
//! let timer = TimerHandle::new(&event_loop, move || flag.set(true)).unwrap();
//! timer.start(250).unwrap();
//!
//! event_loop.run(RunMode::Default);
//! assert!(fired.get());
//! assert_eq!(event_loop.now().as_millis(), 250);
//! ```

mod clock;
mod driver;
mod handle;
mod lab;
mod phase;
mod remote;
mod timer;

pub use clock::{TimeSource, VirtualClock, WallClock};
pub use handle::{HandleKind, PrimitiveOp};
pub use lab::LabConfig;
pub use phase::{CheckHandle, IdleHandle};
pub use remote::Remote;
pub use timer::TimerHandle;

use crate::error::Error;
use crate::tracing_compat::{debug, warn};
use crate::types::Time;
use driver::LoopShared;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// How far [`EventLoop::run`] drives the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunMode {
    /// Run until no live work remains or [`EventLoop::stop`] is called.
    #[default]
    Default,
    /// Run one iteration, blocking in the poll phase if there is nothing
    /// ready.
    Once,
    /// Run one iteration without blocking.
    NoWait,
}

/// A single-threaded event loop.
///
/// Cloning is cheap and yields another handle to the same loop. The loop
/// state is dropped with the last clone; handles created on it then fail
/// with `LoopGone`.
#[derive(Clone)]
pub struct EventLoop {
    shared: Rc<LoopShared>,
}

impl EventLoop {
    /// Creates a loop driven by the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(WallClock::new()))
    }

    /// Creates a loop driven by a custom time source.
    ///
    /// The loop still parks on the wall clock while blocking; use
    /// [`EventLoop::lab`] for virtual time.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            shared: Rc::new(LoopShared::new(clock)),
        }
    }

    /// Creates a deterministic lab loop on virtual time.
    #[must_use]
    pub fn lab(config: LabConfig) -> Self {
        debug!(
            seed = config.seed,
            max_close_delay = config.max_close_delay,
            "lab loop created"
        );
        Self {
            shared: Rc::new(LoopShared::new_lab(config)),
        }
    }

    pub(crate) fn shared(&self) -> &Rc<LoopShared> {
        &self.shared
    }

    /// Returns true if this is a lab loop.
    #[must_use]
    pub fn is_lab(&self) -> bool {
        self.shared.is_lab()
    }

    /// Returns the loop time cached at the start of the current iteration.
    #[must_use]
    pub fn now(&self) -> Time {
        self.shared.now()
    }

    /// Refreshes the cached loop time from the clock.
    pub fn update_time(&self) {
        self.shared.update_time();
    }

    /// Returns the number of iterations run so far.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.shared.iteration()
    }

    /// Returns true while any active referenced handle, pending close or
    /// queued completion exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Returns the number of handles the loop still owns, closing ones
    /// included.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.shared.handle_count()
    }

    /// Returns the number of close requests whose completion has not run.
    #[must_use]
    pub fn pending_closes(&self) -> usize {
        self.shared.pending_closes()
    }

    /// Runs the loop in the given mode and returns whether live work remains.
    ///
    /// A lab loop stops a `Default` run after `max_iterations`.
    pub fn run(&self, mode: RunMode) -> bool {
        let shared = &self.shared;
        let mut alive = shared.is_alive();
        if !alive {
            shared.update_time();
        }
        let limit = shared.iteration_limit();
        let mut iterations = 0_u64;
        while alive && !shared.stop_requested() {
            shared.run_iteration(mode, None);
            alive = shared.is_alive();
            iterations += 1;
            if mode != RunMode::Default {
                break;
            }
            if limit.is_some_and(|limit| iterations >= limit) {
                warn!(iterations, "lab loop hit its iteration limit");
                break;
            }
        }
        shared.clear_stop();
        alive
    }

    /// Runs the loop until its time reaches `deadline`, then finishes the
    /// iteration that started at or after `deadline`.
    ///
    /// Returns early if no live work remains; a lab loop then jumps its
    /// virtual clock straight to `deadline`.
    pub fn run_until(&self, deadline: Time) -> bool {
        let shared = &self.shared;
        let limit = shared.iteration_limit();
        let mut iterations = 0_u64;
        loop {
            if shared.stop_requested() {
                break;
            }
            if !shared.is_alive() {
                shared.advance_virtual(deadline);
                break;
            }
            let started_at = shared.run_iteration(RunMode::Default, Some(deadline));
            iterations += 1;
            if started_at >= deadline {
                break;
            }
            if limit.is_some_and(|limit| iterations >= limit) {
                warn!(iterations, "lab loop hit its iteration limit");
                break;
            }
        }
        shared.clear_stop();
        shared.is_alive()
    }

    /// Runs the loop for `duration` of loop time. See [`run_until`](Self::run_until).
    pub fn run_for(&self, duration: Duration) -> bool {
        self.shared.update_time();
        self.run_until(self.now() + duration)
    }

    /// Asks a running loop to return after the current iteration.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Queues a completion to run in the next drain phase.
    ///
    /// A completion posted from within the drain phase runs in the next
    /// iteration's drain phase.
    pub fn post(&self, completion: impl FnOnce() + 'static) {
        self.shared.post(Box::new(completion));
    }

    /// Queues a completion that becomes ready `after` the current loop time.
    ///
    /// In the lab loop this stands in for I/O that completes at a known
    /// virtual time.
    pub fn inject_completion(&self, after: Duration, completion: impl FnOnce() + 'static) {
        self.shared.post_after(after, Box::new(completion));
    }

    /// Makes the next `op` on any handle of `kind` fail with `error`.
    ///
    /// One-shot: the fault is consumed by the first matching operation.
    pub fn inject_fault(&self, kind: HandleKind, op: PrimitiveOp, error: Error) {
        self.shared.inject_fault(kind, op, error);
    }

    /// Returns a `Send + Sync` poster for this loop.
    #[must_use]
    pub fn remote(&self) -> Remote {
        Remote::new(self.shared.remote_queue().clone())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("now", &self.now())
            .field("iteration", &self.iteration())
            .field("lab", &self.is_lab())
            .field("handles", &self.handle_count())
            .finish()
    }
}
