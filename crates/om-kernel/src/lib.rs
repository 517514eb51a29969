//! Guest-facing resource handles for oxidized-mre
//!
//! Guest code refers to host resources through small integer handles.
//! Each resource family keeps its own [`HandleTable`].

pub mod fs;
pub mod handles;
pub mod sock;

pub use fs::FileBridge;
pub use handles::{to_guest, Handle, HandleTable, INVALID_HANDLE};
pub use sock::{SocError, SocketBridge, SocketConnector, SocketTransport, TcpConnector, TcpEvent};
