//! Deterministic pseudo-random number generator.
//!
//! The lab loop uses this to stagger and reorder close completions. Given
//! the same seed the sequence is always identical, so a close-order failure
//! found once can be replayed from its seed.

/// A deterministic pseudo-random number generator using xorshift64.
///
/// Not cryptographically secure.
#[derive(Debug, Clone)]
pub struct DetRng {
    state: u64,
}

impl DetRng {
    /// Creates a new PRNG with the given seed.
    ///
    /// A zero seed is replaced with 1 (xorshift would stay at zero forever).
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generates the next pseudo-random u64 value.
    #[allow(clippy::missing_const_for_fn)]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generates a pseudo-random value in `[0, bound)`.
    ///
    /// A zero bound yields zero.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }

    /// Shuffles a slice in place using the Fisher-Yates algorithm.
    #[allow(clippy::cast_possible_truncation)]
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        for i in (1..slice.len()).rev() {
            let j = self.next_below(i as u64 + 1) as usize;
            slice.swap(i, j);
        }
    }
}
