//! One-shot teardown bookkeeping.
//!
//! Teardown closes every primitive of the instance; close completions arrive
//! in any order. Only the transition of the outstanding count to zero may
//! release callback references.

use std::cell::Cell;

/// Lifecycle of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TeardownState {
    /// Not torn down.
    #[default]
    Running,
    /// Close requested; `outstanding` completions have not arrived yet.
    Closing {
        /// Close completions still outstanding.
        outstanding: u8,
    },
    /// Every primitive closed and callbacks released.
    Closed,
}

#[derive(Debug, Default)]
pub(crate) struct TeardownCoordinator {
    state: Cell<TeardownState>,
}

impl TeardownCoordinator {
    pub(crate) fn state(&self) -> TeardownState {
        self.state.get()
    }

    pub(crate) fn has_begun(&self) -> bool {
        !matches!(self.state.get(), TeardownState::Running)
    }

    /// Starts teardown with `outstanding` closes. Returns false if teardown
    /// had already begun.
    pub(crate) fn begin(&self, outstanding: u8) -> bool {
        if self.has_begun() {
            return false;
        }
        self.state.set(if outstanding == 0 {
            TeardownState::Closed
        } else {
            TeardownState::Closing { outstanding }
        });
        true
    }

    /// Records one close completion. Returns true exactly once: on the
    /// transition to [`TeardownState::Closed`].
    pub(crate) fn complete_one(&self) -> bool {
        match self.state.get() {
            TeardownState::Closing { outstanding: 1 } => {
                self.state.set(TeardownState::Closed);
                true
            }
            TeardownState::Closing { outstanding } => {
                self.state.set(TeardownState::Closing {
                    outstanding: outstanding - 1,
                });
                false
            }
            TeardownState::Running | TeardownState::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_to_closed_once() {
        let coordinator = TeardownCoordinator::default();
        assert_eq!(coordinator.state(), TeardownState::Running);
        assert!(coordinator.begin(3));
        assert!(!coordinator.begin(3), "second teardown must be ignored");
        assert_eq!(coordinator.state(), TeardownState::Closing { outstanding: 3 });

        assert!(!coordinator.complete_one());
        assert!(!coordinator.complete_one());
        assert!(coordinator.complete_one());
        assert_eq!(coordinator.state(), TeardownState::Closed);
        assert!(!coordinator.complete_one());
    }

    #[test]
    fn completion_before_begin_is_ignored() {
        let coordinator = TeardownCoordinator::default();
        assert!(!coordinator.complete_one());
        assert!(!coordinator.has_begun());
    }
}
