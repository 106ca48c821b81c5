//! Countdown timer primitive.

use super::handle::{HandleKind, PrimitiveOp, RawHandle};
use super::EventLoop;
use crate::error::Result;
use crate::tracing_compat::trace;
use crate::types::{HandleId, Time};

/// A one-shot countdown timer owned by an [`EventLoop`].
///
/// The callback is installed once at creation. [`start`](Self::start)
/// replaces any previous arm; after firing, the timer is disarmed until
/// started again (typically from inside its own callback).
#[derive(Debug)]
pub struct TimerHandle {
    raw: RawHandle,
}

impl TimerHandle {
    /// Creates an inactive, referenced timer.
    ///
    /// # Errors
    ///
    /// Returns the primitive error if handle creation fails.
    pub fn new(event_loop: &EventLoop, callback: impl FnMut() + 'static) -> Result<Self> {
        let raw = RawHandle::open(event_loop, HandleKind::Timer, Box::new(callback))?;
        Ok(Self { raw })
    }

    /// Arms the timer to fire `delay_ms` after the loop's cached time.
    ///
    /// A delay of 0 fires on the next timers phase, never in the current one.
    ///
    /// # Errors
    ///
    /// `HandleClosing` if close was requested, `LoopGone` if the loop was
    /// dropped, or an injected primitive fault.
    pub fn start(&self, delay_ms: u64) -> Result<()> {
        self.raw.operate(PrimitiveOp::Start, |shared, id| {
            let deadline = shared.arm_timer(id, delay_ms);
            trace!(handle = %id, delay_ms, deadline = %deadline, "timer armed");
        })
    }

    /// Disarms the timer. Stopping a disarmed or closing timer is a no-op.
    ///
    /// # Errors
    ///
    /// `LoopGone` if the loop was dropped, or an injected primitive fault.
    pub fn stop(&self) -> Result<()> {
        let shared = self.raw.upgrade()?;
        if let Some(err) = shared.take_fault(HandleKind::Timer, PrimitiveOp::Stop) {
            return Err(err);
        }
        shared.deactivate(self.raw.id());
        Ok(())
    }

    /// Returns true if the timer is armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.raw.is_active()
    }

    /// Returns the absolute deadline if armed.
    #[must_use]
    pub fn deadline(&self) -> Option<Time> {
        self.raw.upgrade().ok()?.timer_deadline(self.raw.id())
    }

    /// Cached time of the owning loop, `None` once the loop is gone.
    pub(crate) fn loop_now(&self) -> Option<Time> {
        self.raw.loop_now()
    }

    /// Marks the timer as keeping the loop alive while armed.
    pub fn ref_handle(&self) {
        self.raw.ref_handle();
    }

    /// Marks the timer as not keeping the loop alive.
    pub fn unref(&self) {
        self.raw.unref();
    }

    /// Returns true if the timer is referenced.
    #[must_use]
    pub fn has_ref(&self) -> bool {
        self.raw.has_ref()
    }

    /// Returns true once close has been requested (or the loop is gone).
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.raw.is_closing()
    }

    /// Requests an asynchronous close; `on_close` runs in a later close phase.
    ///
    /// # Errors
    ///
    /// `LoopGone` if the loop was dropped.
    pub fn close(&self, on_close: impl FnOnce() + 'static) -> Result<()> {
        self.raw.close(Some(Box::new(on_close)))
    }

    /// Returns the loop-assigned handle id.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.raw.id()
    }
}
