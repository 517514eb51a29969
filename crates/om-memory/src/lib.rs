//! Memory management for oxidized-mre
//!
//! A single fixed-capacity arena is reserved at startup; every admitted
//! guest app receives one contiguous, zero-filled region of it for its
//! whole lifetime.

pub mod arena;
pub mod constants;
pub mod pages;

pub use arena::{ArenaRegion, MemoryArena};
pub use constants::*;
