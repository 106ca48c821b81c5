//! Test utilities for unit tests.
//!
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Lab loop constructors
//! - Recording callbacks that count invocations

use crate::error::CallbackError;
use crate::event_loop::{EventLoop, LabConfig};
use crate::scheduler::{ImmediateFire, Rearm, TimerFire};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Default seed used by test lab helpers.
pub const DEFAULT_TEST_SEED: u64 = 0xDEAD_BEEF;

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that mutate process environment variables.
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Create a deterministic lab loop for testing.
#[must_use]
pub fn test_loop() -> EventLoop {
    EventLoop::lab(LabConfig::new(DEFAULT_TEST_SEED))
}

/// Create a lab loop with a specific config.
#[must_use]
pub fn test_loop_with(config: LabConfig) -> EventLoop {
    EventLoop::lab(config)
}

/// Shared invocation log for scheduler callbacks.
#[derive(Debug, Default, Clone)]
pub struct FireLog {
    fires: Rc<Cell<usize>>,
    at_millis: Rc<RefCell<Vec<u64>>>,
}

impl FireLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation at the given loop time.
    pub fn record(&self, now_ms: u64) {
        self.fires.set(self.fires.get() + 1);
        self.at_millis.borrow_mut().push(now_ms);
    }

    /// Returns how many invocations were recorded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.fires.get()
    }

    /// Returns the loop times (ms) of every recorded invocation.
    #[must_use]
    pub fn times(&self) -> Vec<u64> {
        self.at_millis.borrow().clone()
    }
}

/// Timer callback that records each fire and returns `Rearm::Never`.
pub fn one_shot(
    log: &FireLog,
) -> impl FnMut(&mut TimerFire<'_>) -> Result<Rearm, CallbackError> + 'static {
    let log = log.clone();
    move |fire| {
        log.record(fire.now().as_millis());
        Ok(Rearm::Never)
    }
}

/// Immediate callback that records each fire.
pub fn recording_immediate(
    log: &FireLog,
) -> impl FnMut(&mut ImmediateFire<'_>) -> Result<(), CallbackError> + 'static {
    let log = log.clone();
    move |fire| {
        log.record(fire.now().as_millis());
        Ok(())
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
