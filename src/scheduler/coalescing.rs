//! The coalescing timer: one re-armable countdown slot.
//!
//! A fire resets the pending rearm slot to the sentinel, runs the timer-fire
//! callback, then resolves every rearm candidate of that invocation into at
//! most one new arm. Failed invocations fail open: they re-arm at the
//! failure delay so a broken callback is retried instead of silently dying.

use crate::config::RearmPolicy;
use crate::error::{CallbackError, Result};
use crate::event_loop::TimerHandle;
use crate::types::Time;
use std::cell::Cell;

use super::callback::Rearm;

/// Pending rearm request for the invocation in progress.
///
/// `None` is the sentinel ("no request").
#[derive(Debug, Default)]
pub(crate) struct RearmSlot {
    pending: Cell<Option<u64>>,
}

impl RearmSlot {
    pub(crate) fn clear(&self) {
        self.pending.set(None);
    }

    pub(crate) fn get(&self) -> Option<u64> {
        self.pending.get()
    }

    pub(crate) fn take(&self) -> Option<u64> {
        self.pending.take()
    }

    /// Records a request, combining it with an earlier one under `policy`.
    pub(crate) fn request(&self, policy: RearmPolicy, delay_ms: u64) {
        self.pending
            .set(policy.resolve(self.pending.get(), Some(delay_ms)));
    }
}

/// Outcome of resolving one timer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Stay disarmed.
    Disarmed,
    /// Re-arm for the resolved delay.
    Rearm(u64),
    /// The invocation failed; re-arm at the failure delay.
    FailOpen(u64),
}

impl Resolution {
    pub(crate) const fn delay_ms(self) -> Option<u64> {
        match self {
            Self::Disarmed => None,
            Self::Rearm(ms) | Self::FailOpen(ms) => Some(ms),
        }
    }
}

/// Resolves the candidates of one invocation.
pub(crate) fn resolve(
    policy: RearmPolicy,
    failure_delay_ms: u64,
    pending: Option<u64>,
    outcome: &core::result::Result<Rearm, CallbackError>,
) -> Resolution {
    match outcome {
        // The failure delay stands in for the return value.
        Err(_) => Resolution::FailOpen(match policy {
            RearmPolicy::MinimumWins => {
                pending.map_or(failure_delay_ms, |ms| ms.min(failure_delay_ms))
            }
            RearmPolicy::LatestWins => failure_delay_ms,
        }),
        Ok(returned) => match policy.resolve(pending, returned.delay_ms()) {
            Some(ms) => Resolution::Rearm(ms),
            None => Resolution::Disarmed,
        },
    }
}

/// The timer primitive plus its rearm slot.
#[derive(Debug)]
pub(crate) struct CoalescingTimer {
    handle: TimerHandle,
    slot: RearmSlot,
}

impl CoalescingTimer {
    pub(crate) fn new(handle: TimerHandle) -> Self {
        Self {
            handle,
            slot: RearmSlot::default(),
        }
    }

    pub(crate) const fn handle(&self) -> &TimerHandle {
        &self.handle
    }

    pub(crate) const fn slot(&self) -> &RearmSlot {
        &self.slot
    }

    /// Arms for `delay_ms`, replacing any previous arm.
    pub(crate) fn start(&self, delay_ms: u64) -> Result<()> {
        self.handle.start(delay_ms)
    }

    pub(crate) fn stop(&self) -> Result<()> {
        self.handle.stop()
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_active()
    }

    pub(crate) fn deadline(&self) -> Option<Time> {
        self.handle.deadline()
    }
}
