//! Tracing compatibility layer for structured logging.
//!
//! - **With `tracing-integration`**: re-exports the `tracing` crate's macros.
//! - **Without**: no-op macros that compile to nothing.
//!
//! Scheduler lifecycle events (init, arm, fire, rearm, fail-open, teardown)
//! go through these macros, so a host that does not install a subscriber
//! pays nothing for them.
//!
//! ```rust,ignore
//! use tickslot::tracing_compat::{debug, warn};
//!
//! debug!(scheduler = %id, delay_ms, "timer armed");
//! warn!(error = %err, "timer callback failed, re-arming");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
