//! Keep-alive tracking for the scheduler's primitive group.
//!
//! Reference state is always applied to the whole group (timer, check
//! marker, idle marker) so the instance is never partially referenced.

use crate::event_loop::{CheckHandle, IdleHandle, TimerHandle};
use std::cell::Cell;

/// A loop primitive whose keep-alive state can be toggled.
pub(crate) trait KeepAlive {
    fn ref_handle(&self);
    fn unref(&self);
}

macro_rules! impl_keep_alive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeepAlive for $ty {
                fn ref_handle(&self) {
                    <$ty>::ref_handle(self);
                }

                fn unref(&self) {
                    <$ty>::unref(self);
                }
            }
        )*
    };
}

impl_keep_alive!(TimerHandle, CheckHandle, IdleHandle);

#[derive(Debug, Default)]
pub(crate) struct ActivityTracker {
    referenced: Cell<bool>,
}

impl ActivityTracker {
    pub(crate) fn is_referenced(&self) -> bool {
        self.referenced.get()
    }

    pub(crate) fn ref_all(&self, group: &[&dyn KeepAlive]) {
        for member in group {
            member.ref_handle();
        }
        self.referenced.set(true);
    }

    pub(crate) fn unref_all(&self, group: &[&dyn KeepAlive]) {
        for member in group {
            member.unref();
        }
        self.referenced.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, test_loop};

    #[test]
    fn group_ref_state_is_symmetric() {
        init_test_logging();
        let event_loop = test_loop();
        let timer = TimerHandle::new(&event_loop, || {}).unwrap();
        let check = CheckHandle::new(&event_loop, || {}).unwrap();
        let idle = IdleHandle::new(&event_loop, || {}).unwrap();
        let group: [&dyn KeepAlive; 3] = [&timer, &check, &idle];
        let tracker = ActivityTracker::default();

        tracker.unref_all(&group);
        tracker.unref_all(&group);
        assert!(!tracker.is_referenced());
        assert!(!timer.has_ref() && !check.has_ref() && !idle.has_ref());

        tracker.ref_all(&group);
        assert!(tracker.is_referenced());
        assert!(timer.has_ref() && check.has_ref() && idle.has_ref());
    }
}
