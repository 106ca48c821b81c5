//! Scheduler configuration, environment overrides and config file support.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set on
//!    [`SchedulerBuilder`](crate::scheduler::SchedulerBuilder)
//! 2. **Environment variables**: values from `TICKSLOT_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: [`SchedulerConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `TICKSLOT_REARM_POLICY` | `minimum-wins` / `latest-wins` | `rearm_policy` |
//! | `TICKSLOT_FAILURE_REARM_DELAY_MS` | `u64` | `failure_rearm_delay_ms` |

use crate::error::{Error, Result};
use core::fmt;
use std::str::FromStr;

/// Environment variable name for the rearm policy.
pub const ENV_REARM_POLICY: &str = "TICKSLOT_REARM_POLICY";
/// Environment variable name for the delay used after a failed timer callback.
pub const ENV_FAILURE_REARM_DELAY_MS: &str = "TICKSLOT_FAILURE_REARM_DELAY_MS";

/// How competing rearm requests made during one timer invocation resolve.
///
/// A timer invocation can produce two candidates: a pending request made
/// through [`TimerFire::rearm`](crate::scheduler::TimerFire::rearm) and the
/// callback's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "config-file",
    derive(serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum RearmPolicy {
    /// The smallest candidate delay wins (earliest deadline).
    #[default]
    MinimumWins,
    /// The returned value wins; the pending request only applies when the
    /// callback returns no request.
    LatestWins,
}

impl RearmPolicy {
    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MinimumWins => "minimum-wins",
            Self::LatestWins => "latest-wins",
        }
    }

    /// Resolves two optional candidates under this policy.
    #[must_use]
    pub fn resolve(self, pending: Option<u64>, returned: Option<u64>) -> Option<u64> {
        match self {
            Self::MinimumWins => match (pending, returned) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            Self::LatestWins => returned.or(pending),
        }
    }
}

impl fmt::Display for RearmPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RearmPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "minimum-wins" | "minimum" | "min" => Ok(Self::MinimumWins),
            "latest-wins" | "latest" => Ok(Self::LatestWins),
            other => Err(Error::config(format!(
                "unknown rearm policy {other:?} (expected minimum-wins or latest-wins)"
            ))),
        }
    }
}

/// Per-instance scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Resolution of competing rearm requests within one invocation.
    pub rearm_policy: RearmPolicy,
    /// Delay used to rearm after a failed timer callback.
    pub failure_rearm_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rearm_policy: RearmPolicy::MinimumWins,
            failure_rearm_delay_ms: 0,
        }
    }
}

impl SchedulerConfig {
    /// Returns the defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }
}

/// Programmatic overrides, applied last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Overrides [`SchedulerConfig::rearm_policy`].
    pub rearm_policy: Option<RearmPolicy>,
    /// Overrides [`SchedulerConfig::failure_rearm_delay_ms`].
    pub failure_rearm_delay_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Applies every set override to `config`.
    pub fn apply(&self, config: &mut SchedulerConfig) {
        if let Some(v) = self.rearm_policy {
            config.rearm_policy = v;
        }
        if let Some(v) = self.failure_rearm_delay_ms {
            config.failure_rearm_delay_ms = v;
        }
    }
}

/// Resolves the final configuration from a base (defaults or file), the
/// environment (if `use_env`) and programmatic overrides.
///
/// # Errors
///
/// Returns a `Config` error if an environment variable is unparseable.
pub fn resolve(
    base: SchedulerConfig,
    use_env: bool,
    overrides: &ConfigOverrides,
) -> Result<SchedulerConfig> {
    let mut config = base;
    if use_env {
        apply_env_overrides(&mut config)?;
    }
    overrides.apply(&mut config);
    Ok(config)
}

/// Apply environment variable overrides to a [`SchedulerConfig`].
///
/// Only variables that are set in the environment are applied.
///
/// # Errors
///
/// Returns a `Config` error if a variable is set but contains an unparseable
/// value.
pub fn apply_env_overrides(config: &mut SchedulerConfig) -> Result<()> {
    if let Some(val) = read_env(ENV_REARM_POLICY) {
        config.rearm_policy = val.parse().map_err(|e: Error| {
            Error::config(format!(
                "invalid value for {ENV_REARM_POLICY}: {}",
                e.description()
            ))
        })?;
    }
    if let Some(val) = read_env(ENV_FAILURE_REARM_DELAY_MS) {
        config.failure_rearm_delay_ms = parse_u64(ENV_FAILURE_REARM_DELAY_MS, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable scheduler configuration.
///
/// ```toml
/// [scheduler]
/// rearm_policy = "minimum-wins"
/// failure_rearm_delay_ms = 0
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TickslotTomlConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerToml,
}

/// Scheduler section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct SchedulerToml {
    /// Rearm policy.
    pub rearm_policy: Option<RearmPolicy>,
    /// Delay used after a failed timer callback.
    pub failure_rearm_delay_ms: Option<u64>,
}

/// Apply a parsed TOML config to a [`SchedulerConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut SchedulerConfig, toml: &TickslotTomlConfig) {
    if let Some(v) = toml.scheduler.rearm_policy {
        config.rearm_policy = v;
    }
    if let Some(v) = toml.scheduler.failure_rearm_delay_ms {
        config.failure_rearm_delay_ms = v;
    }
}

/// Parse a TOML string into a [`TickslotTomlConfig`].
///
/// # Errors
///
/// Returns a `Config` error on malformed TOML.
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<TickslotTomlConfig> {
    toml::from_str(toml_str)
        .map_err(|e| Error::config(format!("failed to parse TOML config: {e}")))
}

/// Read and parse a TOML file into a [`TickslotTomlConfig`].
///
/// # Errors
///
/// Returns a `Config` error if the file cannot be read or parsed.
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<TickslotTomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    parse_toml_str(&content)
}

/// Loads a [`SchedulerConfig`] from a TOML file on top of the defaults.
///
/// # Errors
///
/// Returns a `Config` error if the file cannot be read or parsed.
#[cfg(feature = "config-file")]
pub fn load_file(path: &std::path::Path) -> Result<SchedulerConfig> {
    let toml = parse_toml_file(path)?;
    let mut config = SchedulerConfig::default();
    apply_toml_config(&mut config, &toml);
    Ok(config)
}

// =========================================================================
// Tests
// =========================================================================
