//! Configuration for the lab loop.
//!
//! The lab loop is deterministic:
//! - Virtual time that advances only when the loop would block
//! - Seeded shuffling of close completions within a close phase
//! - Optional seeded deferral of close completions across iterations
//! - A bound on the number of iterations a `Default` run may take

use crate::util::DetRng;

/// Configuration for the lab loop.
#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Random seed for close ordering decisions.
    pub seed: u64,
    /// Maximum number of extra iterations a close completion may be deferred.
    ///
    /// `0` completes every close in the iteration it was requested, only
    /// shuffling the order within that close phase.
    pub max_close_delay: u64,
    /// Maximum number of iterations before a `Default` run is forced to stop.
    pub max_iterations: Option<u64>,
}

impl LabConfig {
    /// Creates a new lab configuration with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            max_close_delay: 0,
            max_iterations: Some(100_000),
        }
    }

    /// Sets the maximum close deferral, in iterations.
    #[must_use]
    pub const fn max_close_delay(mut self, iterations: u64) -> Self {
        self.max_close_delay = iterations;
        self
    }

    /// Sets the maximum number of iterations.
    #[must_use]
    pub const fn max_iterations(mut self, iterations: u64) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    /// Disables the iteration limit.
    #[must_use]
    pub const fn no_iteration_limit(mut self) -> Self {
        self.max_iterations = None;
        self
    }

    /// Creates a deterministic RNG from this configuration.
    #[must_use]
    pub fn rng(&self) -> DetRng {
        DetRng::new(self.seed)
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self::new(42)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LabConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.max_close_delay, 0);
        assert_eq!(config.max_iterations, Some(100_000));
    }

    #[test]
    fn builder_methods_compose() {
        let config = LabConfig::new(7).max_close_delay(3).no_iteration_limit();
        assert_eq!(config.max_close_delay, 3);
        assert_eq!(config.max_iterations, None);
    }

    #[test]
    fn rng_is_deterministic() {
        let config = LabConfig::new(12345);
        let mut rng1 = config.rng();
        let mut rng2 = config.rng();

        assert_eq!(rng1.next_u64(), rng2.next_u64());
    }
}
