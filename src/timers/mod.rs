//! Multiplexed timeouts, intervals and immediates on one scheduler.
//!
//! [`Timers`] keeps any number of user timers on top of a single
//! [`Scheduler`]: the scheduler's one timer slot is always armed for the
//! earliest timer list, and its immediate drives the immediate queue.
//!
//! Timers with the same duration share a FIFO list. A timer-fire runs every
//! due timer of every due list, then asks the scheduler to re-arm for the
//! next list. Intervals are re-queued at `now + ms` before their callback
//! runs, so an interval that clears itself from its own callback stops.
//!
//! Keep-alive is counted: the first referenced live timer refs the
//! scheduler, the last one to go away (fire, clear or unref) unrefs it.
//!
//! # Example
//!
//! ```
//! use tickslot::event_loop::{EventLoop, LabConfig, RunMode};
//! use tickslot::timers::Timers;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::lab(LabConfig::new(1));
//! let timers = Timers::new(&event_loop).unwrap();
//! let order = Rc::new(RefCell::new(Vec::new()));
//!
//! for (label, ms) in [("slow", 30), ("fast", 10)] {
//!     let order = order.clone();
//!     timers
//!         .set_timeout(Duration::from_millis(ms), move || {
//!             order.borrow_mut().push(label);
//!             Ok(())
//!         })
//!         .unwrap();
//! }
//!
//! event_loop.run(RunMode::Default);
//! assert_eq!(*order.borrow(), vec!["fast", "slow"]);
//! ```

mod list;

use crate::error::{CallbackError, Error, Result};
use crate::event_loop::EventLoop;
use crate::scheduler::{ImmediateFire, Rearm, Scheduler, SchedulerBuilder, TimerFire};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{Time, TimerId};
use crate::util::Arena;
use core::fmt;
use list::ListQueue;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Largest accepted timer duration in milliseconds (2^53 - 1).
///
/// Longer (or shorter than 1 ms) durations are replaced with 1 ms.
pub const MAX_DURATION_MS: u64 = (1 << 53) - 1;

/// A user timer callback.
pub type TimerTask = Box<dyn FnMut() -> core::result::Result<(), CallbackError>>;

/// What kind of timer an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Runs once after its duration.
    Timeout,
    /// Runs every duration until cleared.
    Interval,
    /// Runs once in the next immediate pass.
    Immediate,
}

struct Entry {
    kind: TimerKind,
    ms: u64,
    referenced: bool,
    /// Immediate pass the entry was queued in.
    pass: u64,
    /// `None` while an interval's callback is running.
    task: Option<TimerTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefChange {
    Ref,
    Unref,
}

/// A timer taken off its list, ready to run.
struct Due {
    id: TimerId,
    task: Option<TimerTask>,
    ref_change: Option<RefChange>,
}

#[derive(Default)]
struct State {
    entries: Arena<Entry>,
    lists: ListQueue,
    immediates: VecDeque<TimerId>,
    refs: usize,
    /// Expiry the scheduler timer is expected to fire for.
    next_expiry: Option<Time>,
    /// True while a timer pass runs; re-arming is left to the pass result.
    dispatching: bool,
    immediate_pass: u64,
    paused: bool,
    shut_down: bool,
}

impl State {
    fn inc_ref(&mut self) -> Option<RefChange> {
        self.refs += 1;
        (self.refs == 1).then_some(RefChange::Ref)
    }

    fn dec_ref(&mut self) -> Option<RefChange> {
        debug_assert!(self.refs > 0, "timer refcount underflow");
        self.refs = self.refs.saturating_sub(1);
        (self.refs == 0).then_some(RefChange::Unref)
    }

    /// Re-reads the earliest list after a removal or refresh. Returns true
    /// if the scheduler timer should be stopped.
    fn settle(&mut self, before: Option<(Time, u64)>) -> bool {
        let after = self.lists.peek();
        if self.dispatching || before == after {
            return false;
        }
        match after {
            Some((expiry, _)) => {
                self.next_expiry = Some(expiry);
                false
            }
            None => {
                self.next_expiry = None;
                !self.paused
            }
        }
    }
}

struct Shared {
    event_loop: EventLoop,
    scheduler: RefCell<Option<Scheduler>>,
    state: RefCell<State>,
}

impl Shared {
    fn with_scheduler<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
        self.scheduler.borrow().as_ref().map(f)
    }

    fn apply_ref_change(&self, change: Option<RefChange>) {
        match change {
            Some(RefChange::Ref) => {
                self.with_scheduler(Scheduler::ref_handle);
            }
            Some(RefChange::Unref) => {
                self.with_scheduler(Scheduler::unref);
            }
            None => {}
        }
    }

    fn stop_timer(&self) {
        if let Some(Err(err)) = self.with_scheduler(Scheduler::stop) {
            warn!(error = %err, "failed to stop scheduler timer");
        }
    }

    fn queue_timer(&self, kind: TimerKind, ms: u64, task: TimerTask) -> Result<TimerId> {
        if self.state.borrow().shut_down {
            return Err(Error::torn_down("set_timeout"));
        }
        let now = self.event_loop.now();
        let expiry = now.saturating_add_millis(ms);
        let (id, ref_change, arm) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let id = TimerId::from_arena(state.entries.insert(Entry {
                kind,
                ms,
                referenced: true,
                pass: state.immediate_pass,
                task: Some(task),
            }));
            let ref_change = state.inc_ref();
            state.lists.push(ms, id, expiry);
            let arm = match state.next_expiry {
                Some(next) if next <= expiry => false,
                _ => {
                    state.next_expiry = Some(expiry);
                    !state.paused && !state.dispatching
                }
            };
            (id, ref_change, arm)
        };
        trace!(timer = %id, kind = ?kind, ms, expiry = %expiry, "timer queued");
        self.apply_ref_change(ref_change);
        if arm {
            if let Some(Err(err)) = self.with_scheduler(|scheduler| scheduler.arm_ms(ms)) {
                self.clear(id);
                return Err(err);
            }
        }
        Ok(id)
    }

    fn queue_immediate(&self, task: TimerTask) -> Result<TimerId> {
        if self.state.borrow().shut_down {
            return Err(Error::torn_down("set_immediate"));
        }
        let (id, ref_change) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let id = TimerId::from_arena(state.entries.insert(Entry {
                kind: TimerKind::Immediate,
                ms: 0,
                referenced: true,
                pass: state.immediate_pass,
                task: Some(task),
            }));
            state.immediates.push_back(id);
            (id, state.inc_ref())
        };
        trace!(timer = %id, "immediate queued");
        self.apply_ref_change(ref_change);
        if let Some(Err(err)) = self.with_scheduler(Scheduler::immediate) {
            self.clear(id);
            return Err(err);
        }
        Ok(id)
    }

    fn clear(&self, id: TimerId) {
        let (entry, ref_change, stop) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(entry) = state.entries.remove(id.arena_index()) else {
                return;
            };
            let before = state.lists.peek();
            if entry.kind == TimerKind::Immediate {
                state.immediates.retain(|&queued| queued != id);
            } else {
                state.lists.remove(entry.ms, id);
            }
            let ref_change = if entry.referenced {
                state.dec_ref()
            } else {
                None
            };
            (entry, ref_change, state.settle(before))
        };
        trace!(timer = %id, "timer cleared");
        self.apply_ref_change(ref_change);
        if stop {
            self.stop_timer();
        }
        drop(entry);
    }

    fn refresh(&self, id: TimerId) -> bool {
        let now = self.event_loop.now();
        let stop = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(entry) = state.entries.get(id.arena_index()) else {
                return false;
            };
            if entry.kind == TimerKind::Immediate {
                return false;
            }
            let ms = entry.ms;
            let before = state.lists.peek();
            if !state.lists.remove(ms, id) {
                // Not queued, so there is no expiry to restart.
                return false;
            }
            state.lists.push(ms, id, now.saturating_add_millis(ms));
            state.settle(before)
        };
        if stop {
            self.stop_timer();
        }
        true
    }

    fn set_referenced(&self, id: TimerId, referenced: bool) {
        let change = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(id.arena_index()) else {
                return;
            };
            if entry.referenced == referenced {
                return;
            }
            entry.referenced = referenced;
            if referenced {
                state.inc_ref()
            } else {
                state.dec_ref()
            }
        };
        self.apply_ref_change(change);
    }

    /// Pops the next due timer of list `ms`.
    fn take_due(&self, ms: u64, now: Time) -> Option<Due> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        loop {
            let id = state.lists.pop_due(ms, now)?;
            let Some(entry) = state.entries.get_mut(id.arena_index()) else {
                continue;
            };
            if entry.kind == TimerKind::Interval {
                let task = entry.task.take();
                state.lists.push(ms, id, now.saturating_add_millis(ms));
                return Some(Due {
                    id,
                    task,
                    ref_change: None,
                });
            }
            let Some(entry) = state.entries.remove(id.arena_index()) else {
                continue;
            };
            let ref_change = if entry.referenced {
                state.dec_ref()
            } else {
                None
            };
            return Some(Due {
                id,
                task: entry.task,
                ref_change,
            });
        }
    }

    /// Pops the next immediate queued before pass `pass`.
    fn take_immediate(&self, pass: u64) -> Option<Due> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        loop {
            let id = *state.immediates.front()?;
            match state.entries.get(id.arena_index()) {
                None => {
                    state.immediates.pop_front();
                    continue;
                }
                Some(entry) if entry.pass >= pass => return None,
                Some(_) => {}
            }
            state.immediates.pop_front();
            let Some(entry) = state.entries.remove(id.arena_index()) else {
                continue;
            };
            let ref_change = if entry.referenced {
                state.dec_ref()
            } else {
                None
            };
            return Some(Due {
                id,
                task: entry.task,
                ref_change,
            });
        }
    }

    /// Puts an interval's callback back after it ran. Anything else (a
    /// finished timeout, a timer cleared from its own callback) is dropped.
    fn restore_task(&self, id: TimerId, task: TimerTask) {
        let leftover = {
            let mut state = self.state.borrow_mut();
            match state.entries.get_mut(id.arena_index()) {
                Some(entry) if entry.task.is_none() => {
                    entry.task = Some(task);
                    None
                }
                _ => Some(task),
            }
        };
        drop(leftover);
    }

    /// Scheduler timer-fire: run every due list, return the next delay.
    fn run_timers(&self, fire: &TimerFire<'_>) -> core::result::Result<Rearm, CallbackError> {
        let now = fire.now();
        {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return Ok(Rearm::Never);
            }
            if let Some(next) = state.next_expiry {
                if now < next {
                    let remaining = now.millis_until(next);
                    trace!(now = %now, next = %next, remaining, "timer fired early");
                    return Ok(Rearm::After(remaining));
                }
            }
            state.dispatching = true;
        }

        let mut failure = None;
        'lists: loop {
            let Some(ms) = self.state.borrow().lists.first_due(now) else {
                break;
            };
            while let Some(due) = self.take_due(ms, now) {
                self.apply_ref_change(due.ref_change);
                let Some(mut task) = due.task else {
                    continue;
                };
                let outcome = run_task(&mut task);
                self.restore_task(due.id, task);
                if let Err(err) = outcome {
                    warn!(timer = %due.id, error = %err, "timer callback failed");
                    failure = Some(err);
                    break 'lists;
                }
            }
        }

        let mut state = self.state.borrow_mut();
        state.dispatching = false;
        let rearm = match state.lists.peek() {
            Some((expiry, _)) => {
                state.next_expiry = Some(expiry);
                Rearm::After(now.millis_until(expiry))
            }
            None => {
                state.next_expiry = None;
                Rearm::Never
            }
        };
        trace!(now = %now, rearm = ?rearm, "timer pass finished");
        if let Some(err) = failure {
            // Resume this pass on the fail-open re-arm.
            state.next_expiry = Some(now);
            return Err(err);
        }
        Ok(rearm)
    }

    /// Scheduler immediate-fire: run the immediates queued before this pass.
    fn run_immediates(
        &self,
        fire: &mut ImmediateFire<'_>,
    ) -> core::result::Result<(), CallbackError> {
        let pass = {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return Ok(());
            }
            state.immediate_pass += 1;
            state.immediate_pass
        };

        let mut failure = None;
        while let Some(due) = self.take_immediate(pass) {
            self.apply_ref_change(due.ref_change);
            let Some(mut task) = due.task else {
                continue;
            };
            let outcome = run_task(&mut task);
            drop(task);
            if let Err(err) = outcome {
                warn!(timer = %due.id, error = %err, "immediate callback failed");
                failure = Some(err);
                break;
            }
        }

        let timer_armed = fire.is_timer_armed();
        let (pending, arm) = {
            let mut state = self.state.borrow_mut();
            let arm = if state.paused || state.shut_down || timer_armed {
                None
            } else if let Some((expiry, _)) = state.lists.peek() {
                state.next_expiry = Some(expiry);
                Some(fire.now().millis_until(expiry))
            } else {
                None
            };
            (!state.immediates.is_empty(), arm)
        };
        if pending {
            if let Err(err) = fire.immediate() {
                warn!(error = %err, "failed to request next immediate pass");
            }
        }
        if let Some(delay_ms) = arm {
            if let Err(err) = fire.start_timer(delay_ms) {
                warn!(error = %err, delay_ms, "failed to start timer after immediates");
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn pause(&self) -> Result<()> {
        {
            let state = self.state.borrow();
            if state.paused || state.shut_down {
                return Ok(());
            }
        }
        if let Some(result) = self.with_scheduler(Scheduler::pause) {
            result?;
        }
        self.state.borrow_mut().paused = true;
        debug!("timers paused");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let now = self.event_loop.now();
        let (delay_ms, keep_alive) = {
            let state = self.state.borrow();
            if !state.paused || state.shut_down {
                return Ok(());
            }
            let delay_ms = state.next_expiry.map_or(0, |next| now.millis_until(next));
            (delay_ms, state.refs > 0)
        };
        let delay = i64::try_from(delay_ms).unwrap_or(i64::MAX);
        if let Some(result) = self.with_scheduler(|scheduler| scheduler.resume(delay, keep_alive)) {
            result?;
        }
        self.state.borrow_mut().paused = false;
        debug!(delay_ms, keep_alive, "timers resumed");
        Ok(())
    }

    fn shutdown(&self) {
        let (entries, scheduler) = {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.lists.clear();
            state.immediates.clear();
            state.refs = 0;
            state.next_expiry = None;
            state.dispatching = false;
            (state.entries.drain(), self.scheduler.borrow_mut().take())
        };
        debug!(dropped = entries.len(), "timers shut down");
        drop(entries);
        drop(scheduler);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(task: &mut TimerTask) -> core::result::Result<(), CallbackError> {
    match catch_unwind(AssertUnwindSafe(|| task())) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::from_panic(payload.as_ref())),
    }
}

/// Floors `delay` to whole milliseconds; anything below 1 ms or above
/// [`MAX_DURATION_MS`] becomes 1 ms.
#[must_use]
pub fn normalize_duration(delay: Duration) -> u64 {
    match u64::try_from(delay.as_millis()) {
        Ok(ms) if (1..=MAX_DURATION_MS).contains(&ms) => ms,
        _ => 1,
    }
}

/// Timeouts, intervals and immediates multiplexed on one scheduler.
///
/// Cloning is cheap and shares the same timers. Dropping the last clone
/// shuts the facade down. Timer callbacks that capture a clone keep the
/// facade alive; call [`shutdown`](Self::shutdown) to break such cycles.
#[derive(Clone)]
pub struct Timers {
    shared: Rc<Shared>,
}

impl Timers {
    /// Creates a facade with a default-configured scheduler.
    ///
    /// # Errors
    ///
    /// Returns the primitive error if the scheduler cannot be created.
    pub fn new(event_loop: &EventLoop) -> Result<Self> {
        Self::with_builder(event_loop, Scheduler::builder())
    }

    /// Creates a facade on a scheduler built from `builder`.
    ///
    /// The builder's policy, failure delay and hooks apply; its timer and
    /// immediate callbacks are replaced by the facade's own, and the
    /// scheduler always starts unreferenced.
    ///
    /// # Errors
    ///
    /// A `Config` error or the primitive error from building the scheduler.
    pub fn with_builder(event_loop: &EventLoop, builder: SchedulerBuilder) -> Result<Self> {
        let shared = Rc::new(Shared {
            event_loop: event_loop.clone(),
            scheduler: RefCell::new(None),
            state: RefCell::new(State::default()),
        });
        let for_timer: Weak<Shared> = Rc::downgrade(&shared);
        let for_immediate: Weak<Shared> = Rc::downgrade(&shared);
        let scheduler = builder
            .on_timer(move |fire| {
                for_timer
                    .upgrade()
                    .map_or(Ok(Rearm::Never), |shared| shared.run_timers(fire))
            })
            .on_immediate(move |fire| {
                for_immediate
                    .upgrade()
                    .map_or(Ok(()), |shared| shared.run_immediates(fire))
            })
            .build(event_loop)?;
        debug!(scheduler = %scheduler.id(), "timers created");
        *shared.scheduler.borrow_mut() = Some(scheduler);
        Ok(Self { shared })
    }

    /// Runs `task` once after `delay`.
    ///
    /// # Errors
    ///
    /// `TornDown` after [`shutdown`](Self::shutdown), or the primitive error
    /// if the scheduler timer cannot be armed.
    pub fn set_timeout(
        &self,
        delay: Duration,
        task: impl FnMut() -> core::result::Result<(), CallbackError> + 'static,
    ) -> Result<TimerId> {
        self.shared
            .queue_timer(TimerKind::Timeout, normalize_duration(delay), Box::new(task))
    }

    /// Runs `task` every `period` until cleared.
    ///
    /// # Errors
    ///
    /// `TornDown` after [`shutdown`](Self::shutdown), or the primitive error
    /// if the scheduler timer cannot be armed.
    pub fn set_interval(
        &self,
        period: Duration,
        task: impl FnMut() -> core::result::Result<(), CallbackError> + 'static,
    ) -> Result<TimerId> {
        self.shared
            .queue_timer(TimerKind::Interval, normalize_duration(period), Box::new(task))
    }

    /// Runs `task` once in the next immediate pass.
    ///
    /// # Errors
    ///
    /// `TornDown` after [`shutdown`](Self::shutdown), or the primitive error
    /// if the immediate cannot be requested.
    pub fn set_immediate(
        &self,
        task: impl FnMut() -> core::result::Result<(), CallbackError> + 'static,
    ) -> Result<TimerId> {
        self.shared.queue_immediate(Box::new(task))
    }

    /// Cancels a timer. Unknown, fired and already cleared ids are ignored.
    pub fn clear(&self, id: TimerId) {
        self.shared.clear(id);
    }

    /// Restarts a timeout or interval from the current loop time.
    ///
    /// Returns false if `id` is not a pending timeout or interval.
    pub fn refresh(&self, id: TimerId) -> bool {
        self.shared.refresh(id)
    }

    /// Makes a pending timer keep the loop alive again.
    pub fn ref_timer(&self, id: TimerId) {
        self.shared.set_referenced(id, true);
    }

    /// Stops a pending timer from keeping the loop alive.
    pub fn unref_timer(&self, id: TimerId) {
        self.shared.set_referenced(id, false);
    }

    /// Returns true if `id` is pending and referenced.
    #[must_use]
    pub fn has_ref(&self, id: TimerId) -> bool {
        self.shared
            .state
            .borrow()
            .entries
            .get(id.arena_index())
            .is_some_and(|entry| entry.referenced)
    }

    /// Returns true if `id` is still pending.
    #[must_use]
    pub fn is_active(&self, id: TimerId) -> bool {
        self.shared
            .state
            .borrow()
            .entries
            .contains(id.arena_index())
    }

    /// Returns the kind of a pending timer.
    #[must_use]
    pub fn kind(&self, id: TimerId) -> Option<TimerKind> {
        self.shared
            .state
            .borrow()
            .entries
            .get(id.arena_index())
            .map(|entry| entry.kind)
    }

    /// Number of pending timers, immediates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.borrow().entries.len()
    }

    /// Returns true if no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending referenced timers.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.shared.state.borrow().refs
    }

    /// Expiry the scheduler timer is currently expected to fire for.
    #[must_use]
    pub fn next_expiry(&self) -> Option<Time> {
        self.shared.state.borrow().next_expiry
    }

    /// Suspends the scheduler timer and stops keeping the loop alive.
    ///
    /// # Errors
    ///
    /// The primitive error if the timer cannot be stopped.
    pub fn pause(&self) -> Result<()> {
        self.shared.pause()
    }

    /// Re-arms for the time remaining to the next expiry, keeping the loop
    /// alive if any referenced timer is pending.
    ///
    /// # Errors
    ///
    /// The primitive error if the timer cannot be armed.
    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Returns true between [`pause`](Self::pause) and
    /// [`resume`](Self::resume).
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.state.borrow().paused
    }

    /// Clears every timer, drops their callbacks and tears the scheduler
    /// down. Later `set_*` calls fail with `TornDown`.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.borrow().shut_down
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Timers")
            .field("pending", &state.entries.len())
            .field("queued", &state.lists.len())
            .field("immediates", &state.immediates.len())
            .field("refs", &state.refs)
            .field("next_expiry", &state.next_expiry)
            .field("paused", &state.paused)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
