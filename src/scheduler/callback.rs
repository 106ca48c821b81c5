//! Callback signatures and the contexts handed to them.

use super::Inner;
use crate::error::{CallbackError, Error, Result};
use crate::types::{SchedulerId, Time};
use core::fmt;

/// What a timer-fire callback asks for once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rearm {
    /// No request: the timer stays disarmed unless another request applies.
    #[default]
    Never,
    /// Re-arm after the given delay in milliseconds.
    After(u64),
}

impl Rearm {
    /// Maps a host integer: any negative value is the "no request" sentinel.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Self::Never
        } else {
            Self::After(raw as u64)
        }
    }

    /// Returns the requested delay, if any.
    #[must_use]
    pub const fn delay_ms(self) -> Option<u64> {
        match self {
            Self::Never => None,
            Self::After(ms) => Some(ms),
        }
    }

    /// Returns true for the "no request" sentinel.
    #[must_use]
    pub const fn is_never(self) -> bool {
        matches!(self, Self::Never)
    }
}

impl From<Option<u64>> for Rearm {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Never, Self::After)
    }
}

/// Which scheduler callback an absorbed failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FireKind {
    /// The timer-fire callback.
    Timer,
    /// The immediate-fire callback.
    Immediate,
}

impl fmt::Display for FireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timer => f.write_str("timer"),
            Self::Immediate => f.write_str("immediate"),
        }
    }
}

/// Timer-fire callback.
pub type TimerCallback =
    Box<dyn FnMut(&mut TimerFire<'_>) -> core::result::Result<Rearm, CallbackError>>;
/// Immediate-fire callback.
pub type ImmediateCallback =
    Box<dyn FnMut(&mut ImmediateFire<'_>) -> core::result::Result<(), CallbackError>>;
/// "Teardown complete" hook.
pub type ClosedHook = Box<dyn FnOnce()>;
/// Observer of absorbed callback failures.
pub type ErrorHook = Box<dyn FnMut(FireKind, &CallbackError)>;

/// Context for one timer-fire invocation.
pub struct TimerFire<'a> {
    inner: &'a Inner,
    now: Time,
}

impl<'a> TimerFire<'a> {
    pub(super) const fn new(inner: &'a Inner, now: Time) -> Self {
        Self { inner, now }
    }

    /// Loop time at which the timer fired.
    #[must_use]
    pub const fn now(&self) -> Time {
        self.now
    }

    /// Records a pending rearm request for this invocation.
    ///
    /// Competes with the callback's return value (and with earlier calls)
    /// under the instance's [`RearmPolicy`](crate::config::RearmPolicy).
    pub fn rearm(&mut self, delay_ms: u64) {
        self.inner.request_rearm(delay_ms);
    }

    /// Returns the currently pending request, if any.
    #[must_use]
    pub fn pending_rearm(&self) -> Option<u64> {
        self.inner.pending_rearm()
    }

    /// Id of the firing scheduler.
    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.inner.id()
    }
}

impl fmt::Debug for TimerFire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerFire")
            .field("scheduler", &self.inner.id())
            .field("now", &self.now)
            .finish()
    }
}

/// Context for one immediate-fire invocation.
///
/// Lets the callback drive the instance it belongs to without holding the
/// [`Scheduler`](super::Scheduler) value.
pub struct ImmediateFire<'a> {
    inner: &'a Inner,
    now: Time,
}

impl<'a> ImmediateFire<'a> {
    pub(super) const fn new(inner: &'a Inner, now: Time) -> Self {
        Self { inner, now }
    }

    /// Loop time of the iteration the immediate ran in.
    #[must_use]
    pub const fn now(&self) -> Time {
        self.now
    }

    /// Arms the instance's timer, replacing any previous arm.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn start_timer(&mut self, delay_ms: u64) -> Result<()> {
        self.inner.arm("start_timer", delay_ms)
    }

    /// Disarms the instance's timer.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn stop_timer(&mut self) -> Result<()> {
        self.inner.disarm("stop_timer")
    }

    /// Requests another immediate; it runs on a later iteration.
    ///
    /// # Errors
    ///
    /// `TornDown` once teardown began, or the primitive error.
    pub fn immediate(&mut self) -> Result<()> {
        self.inner.signal_immediate()
    }

    /// Returns true if the instance's timer is armed.
    #[must_use]
    pub fn is_timer_armed(&self) -> bool {
        self.inner.is_timer_armed()
    }

    /// Id of the firing scheduler.
    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.inner.id()
    }
}

impl fmt::Debug for ImmediateFire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmediateFire")
            .field("scheduler", &self.inner.id())
            .field("now", &self.now)
            .finish()
    }
}

/// Flattens a caught callback outcome into a single result.
pub(super) fn flatten<T>(
    outcome: std::thread::Result<core::result::Result<T, CallbackError>>,
) -> core::result::Result<T, CallbackError> {
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::from_panic(payload.as_ref())),
    }
}

/// Rejects negative host delays.
pub(super) fn checked_delay(delay_ms: i64) -> Result<u64> {
    u64::try_from(delay_ms).map_err(|_| Error::invalid_delay(delay_ms))
}
