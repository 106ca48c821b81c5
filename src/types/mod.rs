//! Core types shared by the loop, the scheduler and the timers facade.
//!
//! - [`id`]: identifiers (`HandleId`, `TimerId`, `SchedulerId`) and [`Time`]

pub mod id;

pub use id::{HandleId, SchedulerId, Time, TimerId};
