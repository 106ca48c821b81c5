//! Internal utilities.
//!
//! Kept dependency-free so the lab loop stays deterministic.

pub mod arena;
pub mod det_rng;

pub use arena::{Arena, ArenaIndex};
pub use det_rng::DetRng;
