//! Memory arena constants

/// Allocation granularity of the arena
pub const PAGE_SIZE: u32 = 0x1000;

/// Pages reserved at the bottom of the arena so no region starts at 0
pub const GUARD_PAGES: u32 = 1;

/// Default arena capacity (128 MB)
pub const DEFAULT_ARENA_SIZE: u32 = 0x0800_0000;
