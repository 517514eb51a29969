//! Queued host events

use std::path::PathBuf;

/// Request to load and start a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub path: PathBuf,
    /// Bundled with the runtime rather than supplied by the user
    pub local: bool,
}

/// Key press or release from the host input layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    pub event: i32,
    pub keycode: i32,
}

/// Message posted from one app (or the host) to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageEvent {
    /// Receiving app id
    pub target: i32,
    pub msg_id: u32,
    pub wparam: i32,
    pub lparam: i32,
    /// Sending app id, or -1 for the host
    pub sender: i32,
}
