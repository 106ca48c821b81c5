//! Phase markers: the drain-phase (check) marker and the idle marker.
//!
//! A check marker runs once per iteration, right after the completions of
//! that iteration's drain phase. An idle marker runs once per iteration
//! before the drain phase; while any idle marker is active the loop polls
//! without blocking.

use super::handle::{HandleKind, PrimitiveOp, RawHandle};
use super::EventLoop;
use crate::error::Result;
use crate::types::HandleId;

macro_rules! phase_marker {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            raw: RawHandle,
        }

        impl $name {
            /// Creates an inactive, referenced marker.
            ///
            /// # Errors
            ///
            /// Returns the primitive error if handle creation fails.
            pub fn new(event_loop: &EventLoop, callback: impl FnMut() + 'static) -> Result<Self> {
                let raw = RawHandle::open(event_loop, $kind, Box::new(callback))?;
                Ok(Self { raw })
            }

            /// Activates the marker. Starting an active marker is a no-op.
            ///
            /// # Errors
            ///
            /// `HandleClosing` if close was requested, `LoopGone` if the loop
            /// was dropped, or an injected primitive fault.
            pub fn start(&self) -> Result<()> {
                self.raw
                    .operate(PrimitiveOp::Start, |shared, id| shared.activate_marker(id))
            }

            /// Deactivates the marker. Stopping an inactive or closing marker
            /// is a no-op.
            ///
            /// # Errors
            ///
            /// `LoopGone` if the loop was dropped, or an injected primitive
            /// fault.
            pub fn stop(&self) -> Result<()> {
                let shared = self.raw.upgrade()?;
                if let Some(err) = shared.take_fault($kind, PrimitiveOp::Stop) {
                    return Err(err);
                }
                shared.deactivate(self.raw.id());
                Ok(())
            }

            /// Returns true if the marker is active.
            #[must_use]
            pub fn is_active(&self) -> bool {
                self.raw.is_active()
            }

            /// Marks the marker as keeping the loop alive while active.
            pub fn ref_handle(&self) {
                self.raw.ref_handle();
            }

            /// Marks the marker as not keeping the loop alive.
            pub fn unref(&self) {
                self.raw.unref();
            }

            /// Returns true if the marker is referenced.
            #[must_use]
            pub fn has_ref(&self) -> bool {
                self.raw.has_ref()
            }

            /// Returns true once close has been requested (or the loop is gone).
            #[must_use]
            pub fn is_closing(&self) -> bool {
                self.raw.is_closing()
            }

            /// Requests an asynchronous close; `on_close` runs in a later
            /// close phase.
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
    };
}

phase_marker!(
    /// Drain-phase marker: its callback runs right after the I/O completions
    /// of each iteration while active.
    CheckHandle,
    HandleKind::Check
);

phase_marker!(
    /// Idle marker: its callback runs every iteration while active, and an
    /// active idle marker keeps the poll phase from blocking.
    IdleHandle,
    HandleKind::Idle
);
