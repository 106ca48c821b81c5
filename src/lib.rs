//! Tickslot: a coalescing re-armable timer and next-tick immediate for a
//! cooperative single-threaded event loop.
//!
//! # Overview
//!
//! A [`Scheduler`] is built from three loop primitives: a countdown timer, a
//! drain-phase (check) marker and an idle marker. It offers one timer slot
//! whose next delay is decided by its own callback, a next-tick immediate
//! that runs right after the current iteration's I/O completions, group
//! keep-alive control and one-shot asynchronous teardown.
//!
//! # Core Guarantees
//!
//! - **Single slot**: every rearm candidate of one timer invocation collapses
//!   into at most one new arm
//! - **Fail-open**: a failing (or panicking) timer callback is re-armed at the
//!   failure delay instead of silently stopping
//! - **No spin, no stall**: an armed immediate keeps the loop from blocking and
//!   runs exactly once, after pending completions
//! - **Release once**: callback references are released only after every
//!   primitive's close has completed, whatever the completion order
//! - **Deterministic testing**: a lab loop with virtual time and seeded close
//!   ordering
//!
//! # Module Structure
//!
//! - [`event_loop`]: the host loop, its primitives and the lab mode
//! - [`scheduler`]: the coalescing timer plus immediate
//! - [`timers`]: timeouts, intervals and immediates multiplexed on one scheduler
//! - [`config`]: scheduler configuration (defaults, environment, TOML)
//! - [`error`]: error types
//! - [`types`]: identifiers and loop time
//! - [`tracing_compat`]: structured logging macros
//! - [`util`]: arenas and the deterministic RNG

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod event_loop;
pub mod scheduler;
pub mod timers;
pub mod tracing_compat;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use config::{RearmPolicy, SchedulerConfig};
pub use error::{CallbackError, Error, ErrorKind, Result};
pub use event_loop::{EventLoop, LabConfig, RunMode};
pub use scheduler::{
    FireKind, ImmediateFire, Rearm, Scheduler, SchedulerBuilder, TeardownState, TimerFire,
};
pub use timers::Timers;
pub use types::{SchedulerId, Time, TimerId};
