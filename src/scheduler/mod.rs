//! Coalescing timer scheduler.
//!
//! A [`Scheduler`] owns three loop primitives: one countdown timer, one
//! drain-phase (check) marker and one idle marker. Together they provide:
//!
//! - a single re-armable timer slot whose next delay is decided by its own
//!   callback ([`start`](Scheduler::start), [`Rearm`])
//! - a next-tick "immediate" that runs right after the I/O completions of
//!   the next loop iteration without making the loop spin
//!   ([`immediate`](Scheduler::immediate))
//! - group keep-alive control ([`ref_handle`](Scheduler::ref_handle),
//!   [`unref`](Scheduler::unref), [`pause`](Scheduler::pause),
//!   [`resume`](Scheduler::resume))
//! - one-shot asynchronous teardown when the value is dropped
//!
//! # Callback failures
//!
//! Callback failures never reach the caller that armed the timer. A failing
//! (or panicking) timer callback re-arms the timer at the failure delay
//! (0 ms unless configured otherwise) and the failure is handed to the
//! `on_callback_error` hook, if one is installed.
//!
//! # Example
//!
//! ```
//! use tickslot::event_loop::{EventLoop, LabConfig, RunMode};
//! use tickslot::scheduler::{Rearm, Scheduler};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let event_loop = EventLoop::lab(LabConfig::new(7));
//! let fires = Rc::new(Cell::new(0));
//! let counter = fires.clone();
//!
//! let scheduler = Scheduler::init(
//!     &event_loop,
//!     move |_fire| {
//!         counter.set(counter.get() + 1);
//!         // Fire three times, 10 ms apart.
//!         Ok(if counter.get() < 3 { Rearm::After(10) } else { Rearm::Never })
//!     },
//!     |_fire| Ok(()),
//! )
//! .unwrap();
//!
//! scheduler.ref_handle();
//! scheduler.start(10).unwrap();
//! event_loop.run(RunMode::Default);
//! assert_eq!(fires.get(), 3);
//! assert_eq!(event_loop.now().as_millis(), 30);
//! ```

mod activity;
mod callback;
mod coalescing;
mod phase_pair;
mod teardown;

pub use callback::{
    ClosedHook, ErrorHook, FireKind, ImmediateCallback, ImmediateFire, Rearm, TimerCallback,
    TimerFire,
};
pub use teardown::TeardownState;

use crate::config::{self, ConfigOverrides, RearmPolicy, SchedulerConfig};
use crate::error::{CallbackError, Error, Result};
use crate::event_loop::{CheckHandle, EventLoop, IdleHandle, TimerHandle};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{SchedulerId, Time};
use activity::{ActivityTracker, KeepAlive};
use callback::{checked_delay, flatten};
use coalescing::CoalescingTimer;
use core::fmt;
use phase_pair::PhaseSignal;
use std::cell::{OnceCell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use teardown::TeardownCoordinator;

/// Number of loop primitives owned by one instance.
const PRIMITIVE_COUNT: u8 = 3;

/// State shared between the [`Scheduler`] value and the loop callbacks.
pub(crate) struct Inner {
    id: SchedulerId,
    config: SchedulerConfig,
    timer: CoalescingTimer,
    signal: PhaseSignal,
    activity: ActivityTracker,
    teardown: TeardownCoordinator,
    on_timer: RefCell<Option<TimerCallback>>,
    on_immediate: RefCell<Option<ImmediateCallback>>,
    on_closed: RefCell<Option<ClosedHook>>,
    on_error: RefCell<Option<ErrorHook>>,
}

impl Inner {
    pub(crate) const fn id(&self) -> SchedulerId {
        self.id
    }

    fn now(&self) -> Time {
        self.timer.handle().loop_now().unwrap_or(Time::ZERO)
    }

    fn group(&self) -> [&dyn KeepAlive; 3] {
        [
            self.timer.handle(),
            self.signal.check(),
            self.signal.idle(),
        ]
    }

    fn ensure_running(&self, op: &str) -> Result<()> {
        if self.teardown.has_begun() {
            return Err(Error::torn_down(op));
        }
        Ok(())
    }

    pub(crate) fn arm(&self, op: &str, delay_ms: u64) -> Result<()> {
        self.ensure_running(op)?;
        self.timer.start(delay_ms)?;
        trace!(scheduler = %self.id, delay_ms, "timer armed");
        Ok(())
    }

    pub(crate) fn disarm(&self, op: &str) -> Result<()> {
        self.ensure_running(op)?;
        self.timer.stop()
    }

    pub(crate) fn signal_immediate(&self) -> Result<()> {
        self.ensure_running("immediate")?;
        self.signal.arm()?;
        trace!(scheduler = %self.id, "immediate requested");
        Ok(())
    }

    pub(crate) fn request_rearm(&self, delay_ms: u64) {
        self.timer
            .slot()
            .request(self.config.rearm_policy, delay_ms);
    }

    pub(crate) fn pending_rearm(&self) -> Option<u64> {
        self.timer.slot().get()
    }

    pub(crate) fn is_timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    // ------------------------------------------------------------------
    // Loop-side entry points
    // ------------------------------------------------------------------

    /// Timer expiry: reset the slot, invoke, resolve, re-arm.
    fn fire_timer(&self) {
        if self.teardown.has_begun() {
            return;
        }
        self.timer.slot().clear();
        let Some(mut callback) = self.on_timer.borrow_mut().take() else {
            return;
        };
        let now = self.now();
        trace!(scheduler = %self.id, now = %now, "timer fired");

        let outcome = {
            let mut fire = TimerFire::new(self, now);
            flatten(catch_unwind(AssertUnwindSafe(|| callback(&mut fire))))
        };
        self.restore_timer_callback(callback);

        let pending = self.timer.slot().take();
        let resolution = coalescing::resolve(
            self.config.rearm_policy,
            self.config.failure_rearm_delay_ms,
            pending,
            &outcome,
        );

        if let Err(err) = &outcome {
            warn!(
                scheduler = %self.id,
                error = %err,
                panicked = err.is_panic(),
                "timer callback failed, failing open"
            );
        }
        if let Some(delay_ms) = resolution.delay_ms() {
            if self.teardown.has_begun() {
                trace!(scheduler = %self.id, "teardown began during fire, not re-arming");
            } else if let Err(err) = self.timer.start(delay_ms) {
                warn!(scheduler = %self.id, error = %err, delay_ms, "re-arm failed");
            } else {
                trace!(scheduler = %self.id, resolution = ?resolution, "timer re-armed");
            }
        }
        if let Err(err) = outcome {
            self.report(FireKind::Timer, &err);
        }
    }

    /// Drain-phase marker: disarm both markers, then deliver the immediate.
    ///
    /// Delivery waits until the pair is disarmed, so one request runs the
    /// callback once.
    fn fire_immediate(&self) {
        if self.teardown.has_begun() {
            return;
        }
        if let Err(err) = self.signal.disarm() {
            // The pair is still armed: deliver on a later drain phase.
            warn!(
                scheduler = %self.id,
                error = %err,
                "failed to disarm phase markers, deferring immediate"
            );
            return;
        }
        let Some(mut callback) = self.on_immediate.borrow_mut().take() else {
            return;
        };
        let now = self.now();
        trace!(scheduler = %self.id, now = %now, "immediate fired");

        let outcome = {
            let mut fire = ImmediateFire::new(self, now);
            flatten(catch_unwind(AssertUnwindSafe(|| callback(&mut fire))))
        };
        self.restore_immediate_callback(callback);

        if let Err(err) = outcome {
            warn!(scheduler = %self.id, error = %err, "immediate callback failed");
            self.report(FireKind::Immediate, &err);
        }
    }

    fn restore_timer_callback(&self, callback: TimerCallback) {
        if self.teardown.state() == TeardownState::Closed {
            drop(callback);
            return;
        }
        *self.on_timer.borrow_mut() = Some(callback);
    }

    fn restore_immediate_callback(&self, callback: ImmediateCallback) {
        if self.teardown.state() == TeardownState::Closed {
            drop(callback);
            return;
        }
        *self.on_immediate.borrow_mut() = Some(callback);
    }

    fn report(&self, kind: FireKind, err: &CallbackError) {
        let Some(mut hook) = self.on_error.borrow_mut().take() else {
            return;
        };
        hook(kind, err);
        if self.teardown.state() == TeardownState::Closed {
            drop(hook);
        } else {
            let mut slot = self.on_error.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(self: &Rc<Self>) {
        if !self.teardown.begin(PRIMITIVE_COUNT) {
            return;
        }
        debug!(scheduler = %self.id, "teardown begin");

        let closes = [
            self.timer.handle().close(self.close_completion()),
            self.signal.check().close(self.close_completion()),
            self.signal.idle().close(self.close_completion()),
        ];
        for result in closes {
            if let Err(err) = result {
                // The loop is gone; nothing will ever complete this close.
                debug!(scheduler = %self.id, error = %err, "close failed, completing immediately");
                self.close_completed();
            }
        }
    }

    fn close_completion(self: &Rc<Self>) -> impl FnOnce() + 'static {
        let inner = Rc::clone(self);
        move || inner.close_completed()
    }

    fn close_completed(&self) {
        trace!(scheduler = %self.id, state = ?self.teardown.state(), "close completed");
        if self.teardown.complete_one() {
            self.release();
        }
    }

    /// Releases every callback reference exactly once, then signals
    /// "teardown complete".
    fn release(&self) {
        let on_timer = self.on_timer.borrow_mut().take();
        let on_immediate = self.on_immediate.borrow_mut().take();
        let on_error = self.on_error.borrow_mut().take();
        let on_closed = self.on_closed.borrow_mut().take();
        drop(on_timer);
        drop(on_immediate);
        drop(on_error);
        debug!(scheduler = %self.id, "teardown complete");
        if let Some(hook) = on_closed {
            hook();
        }
    }
}

/// A coalescing timer plus next-tick immediate bound to one event loop.
///
/// Created with [`Scheduler::init`] or [`Scheduler::builder`]. Dropping the
/// value (or calling [`teardown`](Self::teardown)) closes the primitives;
/// callbacks are released once all three closes have completed.
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Creates an instance with default configuration.
    ///
    /// The instance starts unreferenced, with the timer disarmed and no
    /// immediate pending.
    ///
    /// # Errors
    ///
    /// Returns the primitive error if any of the three primitives cannot be
    /// created; primitives created before the failure are closed again.
    pub fn init<T, I>(event_loop: &EventLoop, on_timer: T, on_immediate: I) -> Result<Self>
    where
        T: FnMut(&mut TimerFire<'_>) -> core::result::Result<Rearm, CallbackError> + 'static,
        I: FnMut(&mut ImmediateFire<'_>) -> core::result::Result<(), CallbackError> + 'static,
    {
        Self::builder()
            .on_timer(on_timer)
            .on_immediate(on_immediate)
            .build(event_loop)
    }

    /// Returns a builder for a configured instance.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Returns this instance's id.
    #[must_use]
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    /// Returns the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Arms the timer for `delay_ms`, replacing any previous arm.
    ///
    /// # Errors
    ///
    /// `InvalidDelay` for a negative delay, `TornDown` once teardown began,
    /// or the primitive error.
    pub fn start(&self, delay_ms: i64) -> Result<()> {
        self.inner.ensure_running("start")?;
        let delay_ms = checked_delay(delay_ms)?;
        self.inner.arm("start", delay_ms)
    }

    /// Arms the timer for an already validated delay.
    pub(crate) fn arm_ms(&self, delay_ms: u64) -> Result<()> {
        self.inner.arm("start", delay_ms)
    }

    /// Disarms the timer. Stopping a disarmed timer is a no-op.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn stop(&self) -> Result<()> {
        self.inner.disarm("stop")
    }

    /// Disarms the timer and unreferences the whole group.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn pause(&self) -> Result<()> {
        self.inner.disarm("pause")?;
        self.inner.activity.unref_all(&self.inner.group());
        debug!(scheduler = %self.inner.id, "paused");
        Ok(())
    }

    /// Re-references the group if `keep_alive`, resets the pending rearm
    /// request and arms the timer for `delay_ms`.
    ///
    /// # Errors
    ///
    /// `InvalidDelay` for a negative delay, `TornDown` once teardown began,
    /// or the primitive error.
    pub fn resume(&self, delay_ms: i64, keep_alive: bool) -> Result<()> {
        self.inner.ensure_running("resume")?;
        let delay_ms = checked_delay(delay_ms)?;
        if keep_alive {
            self.inner.activity.ref_all(&self.inner.group());
        }
        self.inner.timer.slot().clear();
        self.inner.arm("resume", delay_ms)?;
        debug!(scheduler = %self.inner.id, delay_ms, keep_alive, "resumed");
        Ok(())
    }

    /// Makes all three primitives keep the loop alive. No-op after teardown
    /// began.
    pub fn ref_handle(&self) {
        if self.inner.teardown.has_begun() {
            return;
        }
        self.inner.activity.ref_all(&self.inner.group());
    }

    /// Makes all three primitives non-blocking. No-op after teardown began.
    pub fn unref(&self) {
        if self.inner.teardown.has_begun() {
            return;
        }
        self.inner.activity.unref_all(&self.inner.group());
    }

    /// Requests the immediate callback on the next drain phase.
    ///
    /// Repeated calls before it runs are coalesced into one invocation.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn immediate(&self) -> Result<()> {
        self.inner.signal_immediate()
    }

    /// Begins teardown. Only the first call has any effect; dropping the
    /// value calls this too.
    pub fn teardown(&self) {
        Inner::teardown(&self.inner);
    }

    /// Returns true if the group currently keeps the loop alive.
    #[must_use]
    pub fn is_referenced(&self) -> bool {
        self.inner.activity.is_referenced()
    }

    /// Returns true if the timer is armed.
    #[must_use]
    pub fn is_timer_armed(&self) -> bool {
        self.inner.is_timer_armed()
    }

    /// Returns the timer's absolute deadline if armed.
    #[must_use]
    pub fn timer_deadline(&self) -> Option<Time> {
        self.inner.timer.deadline()
    }

    /// Returns true if an immediate is requested and has not run yet.
    #[must_use]
    pub fn is_immediate_pending(&self) -> bool {
        self.inner.signal.is_pending()
    }

    /// Returns the teardown lifecycle state.
    #[must_use]
    pub fn teardown_state(&self) -> TeardownState {
        self.inner.teardown.state()
    }

    /// Returns a weak observer that outlives the value, for watching
    /// teardown progress after drop.
    #[must_use]
    pub fn observer(&self) -> SchedulerObserver {
        SchedulerObserver {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        Inner::teardown(&self.inner);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("armed", &self.is_timer_armed())
            .field("immediate_pending", &self.is_immediate_pending())
            .field("referenced", &self.is_referenced())
            .field("teardown", &self.teardown_state())
            .finish()
    }
}

/// Weak view of a scheduler instance.
///
/// Reports [`TeardownState::Closed`] once the instance's state has been
/// freed.
#[derive(Debug, Clone)]
pub struct SchedulerObserver {
    inner: Weak<Inner>,
}

impl SchedulerObserver {
    /// Returns the teardown state of the observed instance.
    #[must_use]
    pub fn teardown_state(&self) -> TeardownState {
        self.inner
            .upgrade()
            .map_or(TeardownState::Closed, |inner| inner.teardown.state())
    }

    /// Returns true once the instance's shared state has been freed.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

/// Builder for a configured [`Scheduler`].
pub struct SchedulerBuilder {
    base: SchedulerConfig,
    use_env: bool,
    overrides: ConfigOverrides,
    #[cfg(feature = "config-file")]
    config_file: Option<std::path::PathBuf>,
    on_timer: Option<TimerCallback>,
    on_immediate: Option<ImmediateCallback>,
    on_closed: Option<ClosedHook>,
    on_error: Option<ErrorHook>,
}

impl SchedulerBuilder {
    /// Creates a builder with default configuration and no-op callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: SchedulerConfig::default(),
            use_env: false,
            overrides: ConfigOverrides::default(),
            #[cfg(feature = "config-file")]
            config_file: None,
            on_timer: None,
            on_immediate: None,
            on_closed: None,
            on_error: None,
        }
    }

    /// Replaces the base configuration (the layer below environment and
    /// programmatic overrides).
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.base = config;
        self
    }

    /// Applies `TICKSLOT_*` environment overrides on top of the base.
    #[must_use]
    pub const fn with_env(mut self, enabled: bool) -> Self {
        self.use_env = enabled;
        self
    }

    /// Loads the base configuration from a TOML file at build time.
    #[cfg(feature = "config-file")]
    #[must_use]
    pub fn config_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Sets the rearm policy (programmatic override).
    #[must_use]
    pub const fn rearm_policy(mut self, policy: RearmPolicy) -> Self {
        self.overrides.rearm_policy = Some(policy);
        self
    }

    /// Sets the delay used after a failed timer callback (programmatic
    /// override).
    #[must_use]
    pub const fn failure_rearm_delay_ms(mut self, delay_ms: u64) -> Self {
        self.overrides.failure_rearm_delay_ms = Some(delay_ms);
        self
    }

    /// Sets the timer-fire callback.
    #[must_use]
    pub fn on_timer(
        mut self,
        callback: impl FnMut(&mut TimerFire<'_>) -> core::result::Result<Rearm, CallbackError>
            + 'static,
    ) -> Self {
        self.on_timer = Some(Box::new(callback));
        self
    }

    /// Sets the immediate-fire callback.
    #[must_use]
    pub fn on_immediate(
        mut self,
        callback: impl FnMut(&mut ImmediateFire<'_>) -> core::result::Result<(), CallbackError>
            + 'static,
    ) -> Self {
        self.on_immediate = Some(Box::new(callback));
        self
    }

    /// Sets the "teardown complete" hook.
    #[must_use]
    pub fn on_closed(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.on_closed = Some(Box::new(hook));
        self
    }

    /// Sets the observer for absorbed callback failures.
    #[must_use]
    pub fn on_callback_error(mut self, hook: impl FnMut(FireKind, &CallbackError) + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    fn resolve_config(&self) -> Result<SchedulerConfig> {
        #[cfg(feature = "config-file")]
        let base = match &self.config_file {
            Some(path) => config::load_file(path)?,
            None => self.base.clone(),
        };
        #[cfg(not(feature = "config-file"))]
        let base = self.base.clone();
        config::resolve(base, self.use_env, &self.overrides)
    }

    /// Creates the primitives on `event_loop` and returns the instance.
    ///
    /// # Errors
    ///
    /// A `Config` error if configuration cannot be resolved, or the primitive
    /// error if a primitive cannot be created. Primitives created before a
    /// failure are closed again.
    pub fn build(self, event_loop: &EventLoop) -> Result<Scheduler> {
        let config = self.resolve_config()?;
        let id = SchedulerId::next();

        let link: Rc<OnceCell<Weak<Inner>>> = Rc::new(OnceCell::new());
        let timer = TimerHandle::new(event_loop, trampoline(&link, Inner::fire_timer))?;
        let check = CheckHandle::new(event_loop, trampoline(&link, Inner::fire_immediate))?;
        let idle = IdleHandle::new(event_loop, || {})?;

        let inner = Rc::new(Inner {
            id,
            config,
            timer: CoalescingTimer::new(timer),
            signal: PhaseSignal::new(check, idle),
            activity: ActivityTracker::default(),
            teardown: TeardownCoordinator::default(),
            on_timer: RefCell::new(Some(
                self.on_timer
                    .unwrap_or_else(|| Box::new(|_: &mut TimerFire<'_>| Ok(Rearm::Never))),
            )),
            on_immediate: RefCell::new(Some(
                self.on_immediate
                    .unwrap_or_else(|| Box::new(|_: &mut ImmediateFire<'_>| Ok(()))),
            )),
            on_closed: RefCell::new(self.on_closed),
            on_error: RefCell::new(self.on_error),
        });
        let _ = link.set(Rc::downgrade(&inner));

        inner.activity.unref_all(&inner.group());
        debug!(
            scheduler = %id,
            policy = %inner.config.rearm_policy,
            "scheduler initialized"
        );
        Ok(Scheduler { inner })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("base", &self.base)
            .field("use_env", &self.use_env)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// Loop-side callback that forwards to the instance while it exists.
fn trampoline(link: &Rc<OnceCell<Weak<Inner>>>, entry: fn(&Inner)) -> impl FnMut() + 'static {
    let link = Rc::clone(link);
    move || {
        if let Some(inner) = link.get().and_then(Weak::upgrade) {
            entry(&inner);
        }
    }
}
