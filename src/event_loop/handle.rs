//! Handle records and the shared handle plumbing.
//!
//! Every primitive (countdown timer, check marker, idle marker) is a record
//! in the loop's handle arena. The public handle types are thin wrappers
//! around [`RawHandle`], which owns the record id and a weak reference back
//! to the loop. Dropping a handle that was never closed closes it without a
//! completion callback.

use super::driver::LoopShared;
use super::EventLoop;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::trace;
use crate::types::{HandleId, Time};
use core::fmt;
use std::rc::{Rc, Weak};

/// The kind of loop primitive a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Countdown timer, run in the timers phase.
    Timer,
    /// Drain-phase marker, run in the check phase right after I/O completions.
    Check,
    /// Idle marker; while active the loop never blocks.
    Idle,
}

impl HandleKind {
    /// Returns a short lowercase name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Check => "check",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Primitive operations that can be targeted by fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveOp {
    /// Creating the handle.
    Init,
    /// Arming a timer or activating a marker.
    Start,
    /// Disarming a timer or deactivating a marker.
    Stop,
}

pub(crate) type HandleCallback = Box<dyn FnMut()>;
pub(crate) type CloseCallback = Box<dyn FnOnce()>;

/// Position of an armed timer in the loop's timer index.
///
/// Ordered by deadline, then by arm sequence, so timers due at the same
/// instant fire in the order they were armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) deadline: Time,
    pub(crate) seq: u64,
}

pub(crate) struct HandleRecord {
    pub(crate) kind: HandleKind,
    pub(crate) active: bool,
    pub(crate) referenced: bool,
    pub(crate) closing: bool,
    /// `None` while the callback is running or after close was requested.
    pub(crate) callback: Option<HandleCallback>,
    pub(crate) timer_key: Option<TimerKey>,
}

impl HandleRecord {
    pub(crate) fn new(kind: HandleKind, callback: HandleCallback) -> Self {
        Self {
            kind,
            active: false,
            referenced: true,
            closing: false,
            callback: Some(callback),
            timer_key: None,
        }
    }

    /// True if this record keeps the loop alive.
    pub(crate) const fn keeps_alive(&self) -> bool {
        self.active && self.referenced && !self.closing
    }
}

impl fmt::Debug for HandleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRecord")
            .field("kind", &self.kind)
            .field("active", &self.active)
            .field("referenced", &self.referenced)
            .field("closing", &self.closing)
            .field("timer_key", &self.timer_key)
            .finish_non_exhaustive()
    }
}

/// Shared plumbing behind [`TimerHandle`](super::TimerHandle),
/// [`CheckHandle`](super::CheckHandle) and [`IdleHandle`](super::IdleHandle).
pub(crate) struct RawHandle {
    id: HandleId,
    kind: HandleKind,
    shared: Weak<LoopShared>,
}

impl RawHandle {
    pub(crate) fn open(
        event_loop: &EventLoop,
        kind: HandleKind,
        callback: HandleCallback,
    ) -> Result<Self> {
        let shared = event_loop.shared();
        if let Some(err) = shared.take_fault(kind, PrimitiveOp::Init) {
            return Err(err);
        }
        let id = shared.insert_handle(HandleRecord::new(kind, callback));
        trace!(handle = %id, kind = %kind, "handle opened");
        Ok(Self {
            id,
            kind,
            shared: Rc::downgrade(shared),
        })
    }

    pub(crate) const fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Result<Rc<LoopShared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::LoopGone))
    }

    /// Runs an activation-changing operation on an open record.
    ///
    /// Fails with `LoopGone` if the loop was dropped, with an injected fault
    /// if one targets `(kind, op)`, and with `HandleClosing` if close was
    /// already requested.
    pub(crate) fn operate<R>(
        &self,
        op: PrimitiveOp,
        f: impl FnOnce(&LoopShared, HandleId) -> R,
    ) -> Result<R> {
        let shared = self.upgrade()?;
        if let Some(err) = shared.take_fault(self.kind, op) {
            return Err(err);
        }
        if !shared.is_open(self.id) {
            return Err(Error::new(ErrorKind::HandleClosing)
                .with_message(format!("{} handle {} is closing", self.kind, self.id)));
        }
        Ok(f(&shared, self.id))
    }

    /// Cached time of the owning loop, `None` once the loop is gone.
    pub(crate) fn loop_now(&self) -> Option<Time> {
        self.shared.upgrade().map(|shared| shared.now())
    }

    pub(crate) fn ref_handle(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_referenced(self.id, true);
        }
    }

    pub(crate) fn unref(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_referenced(self.id, false);
        }
    }

    pub(crate) fn has_ref(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_referenced(self.id))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_active(self.id))
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.shared
            .upgrade()
            .map_or(true, |shared| !shared.is_open(self.id))
    }

    /// Requests an asynchronous close.
    ///
    /// Closing twice is a no-op and the second `on_close` is dropped
    /// without running.
    pub(crate) fn close(&self, on_close: Option<CloseCallback>) -> Result<()> {
        let shared = self.upgrade()?;
        shared.request_close(self.id, on_close);
        Ok(())
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.is_open(self.id) {
                trace!(handle = %self.id, kind = %self.kind, "handle dropped while open, closing");
                shared.request_close(self.id, None);
            }
        }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
