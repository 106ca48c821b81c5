//! Error types and error handling strategy.
//!
//! Errors are explicit and typed. Every [`Error`] carries an [`ErrorKind`],
//! a platform-style code name (`EINVAL`, `ENXIO`, ...) and an optional
//! description, so a host binding can surface both the name and the message
//! of the underlying failure.
//!
//! # Error Categories
//!
//! - **Configuration**: rejected synchronously at the call boundary
//!   (negative delay, instance already torn down, bad config value)
//! - **Primitive**: the underlying loop primitive refused the operation
//!   (handle closing, loop dropped, injected fault); never retried here
//! - **Internal**: a broken invariant
//!
//! Failures raised by user callbacks are a separate type,
//! [`CallbackError`]. The scheduler absorbs them and turns them into
//! scheduling behavior; they never reach whoever armed the timer.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Configuration ===
    /// A delay below zero was passed to `start` or `resume`.
    InvalidDelay,
    /// The scheduler instance has begun (or finished) teardown.
    TornDown,
    /// A configuration value could not be parsed or loaded.
    Config,

    // === Primitive ===
    /// The loop primitive is closing or already closed.
    HandleClosing,
    /// The event loop that owned the primitive has been dropped.
    LoopGone,
    /// The loop primitive reported a failure of its own.
    Primitive,

    // === Internal ===
    /// Internal invariant violation (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidDelay | Self::TornDown | Self::Config => ErrorCategory::Configuration,
            Self::HandleClosing | Self::LoopGone | Self::Primitive => ErrorCategory::Primitive,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the default platform-style error name for this kind.
    #[must_use]
    pub const fn code_name(&self) -> &'static str {
        match self {
            Self::InvalidDelay | Self::Config | Self::HandleClosing => "EINVAL",
            Self::TornDown => "ECANCELED",
            Self::LoopGone => "ENXIO",
            Self::Primitive => "EIO",
            Self::Internal => "EFAULT",
        }
    }

    /// Returns the default platform-style description for this kind.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidDelay | Self::Config | Self::HandleClosing => "invalid argument",
            Self::TornDown => "operation canceled",
            Self::LoopGone => "no such device or address",
            Self::Primitive => "i/o error",
            Self::Internal => "bad address",
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caller-side mistakes rejected at the call boundary.
    Configuration,
    /// Failures reported by a loop primitive.
    Primitive,
    /// Internal errors.
    Internal,
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    code: &'static str,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind and its default code name.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            code: kind.code_name(),
            message: None,
            source: None,
        }
    }

    /// Creates a primitive failure with an explicit platform code name.
    #[must_use]
    pub fn primitive(code: &'static str, description: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Primitive,
            code,
            message: Some(description.into()),
            source: None,
        }
    }

    /// Creates an invalid delay error.
    #[must_use]
    pub fn invalid_delay(delay_ms: i64) -> Self {
        Self::new(ErrorKind::InvalidDelay)
            .with_message(format!("delay must be >= 0ms, got {delay_ms}ms"))
    }

    /// Creates a torn-down error for the named operation.
    #[must_use]
    pub fn torn_down(op: &str) -> Self {
        Self::new(ErrorKind::TornDown).with_message(format!("{op} after teardown began"))
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }

    /// Creates an internal error (bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the platform-style error name (`EINVAL`, `ENXIO`, ...).
    #[must_use]
    pub const fn code_name(&self) -> &'static str {
        self.code
    }

    /// Returns the description: the attached message, or the kind's
    /// default description.
    #[must_use]
    pub fn description(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or_else(|| self.kind.description())
    }

    /// Returns the attached message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error was rejected at the call boundary.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self.kind.category(), ErrorCategory::Configuration)
    }

    /// Returns true if the scheduler instance was already torn down.
    #[must_use]
    pub const fn is_torn_down(&self) -> bool {
        matches!(self.kind, ErrorKind::TornDown)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.code, self.kind, self.description())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for scheduler and loop operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Failure raised by a user callback.
///
/// The scheduler never propagates these: a failing timer callback is
/// re-armed at the failure delay (0 ms by default) and the error is handed
/// to the instance's error hook, if one is installed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    panicked: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CallbackError {
    /// Creates a callback failure with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
            source: None,
        }
    }

    /// Wraps an arbitrary error raised by callback code.
    #[must_use]
    pub fn from_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            panicked: false,
            source: Some(Box::new(source)),
        }
    }

    /// Builds a callback failure from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callback panicked".to_string());
        Self {
            message,
            panicked: true,
            source: None,
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the failure was a caught panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        self.panicked
    }
}
