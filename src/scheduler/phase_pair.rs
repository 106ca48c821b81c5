//! Next-tick signal built from a drain-phase marker and an idle marker.
//!
//! The check marker delivers the immediate right after the completions of
//! the iteration it is observed in. The idle marker only keeps the poll
//! phase from blocking, so that iteration arrives without waiting for I/O.

use crate::error::Result;
use crate::event_loop::{CheckHandle, IdleHandle};

#[derive(Debug)]
pub(crate) struct PhaseSignal {
    check: CheckHandle,
    idle: IdleHandle,
}

impl PhaseSignal {
    pub(crate) const fn new(check: CheckHandle, idle: IdleHandle) -> Self {
        Self { check, idle }
    }

    pub(crate) const fn check(&self) -> &CheckHandle {
        &self.check
    }

    pub(crate) const fn idle(&self) -> &IdleHandle {
        &self.idle
    }

    /// Arms both markers. Arming an already armed pair is a no-op.
    ///
    /// If the idle marker fails to start, the check marker is disarmed again
    /// so the pair is never left half armed.
    pub(crate) fn arm(&self) -> Result<()> {
        self.check.start()?;
        if let Err(err) = self.idle.start() {
            return Err(match self.check.stop() {
                Ok(()) => err,
                Err(rollback) => rollback.with_source(err),
            });
        }
        Ok(())
    }

    /// Disarms both markers.
    ///
    /// On failure both markers are left armed: a failed check stop changes
    /// nothing, and a failed idle stop restarts the check marker.
    pub(crate) fn disarm(&self) -> Result<()> {
        self.check.stop()?;
        if let Err(err) = self.idle.stop() {
            return Err(match self.check.start() {
                Ok(()) => err,
                Err(rollback) => rollback.with_source(err),
            });
        }
        Ok(())
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.check.is_active()
    }
}
