//! Error types for the oxidized-mre runtime

use thiserror::Error;

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Memory arena errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of memory: requested 0x{requested:x} bytes, 0x{available:x} available")]
    OutOfMemory { requested: u32, available: u32 },

    #[error("Invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("Access out of bounds at 0x{addr:08x} (+0x{len:x})")]
    OutOfBounds { addr: u32, len: u32 },
}

/// Guest image loading errors
///
/// Every variant is fatal to a single launch attempt only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Malformed image: {0}")]
    MalformedImage(String),

    #[error(
        "Resource blob missing: declared 0x{size:x} bytes at 0x{offset:x} \
         but package is only 0x{package_len:x} bytes"
    )]
    ResourceBlobMissing {
        offset: u64,
        size: u64,
        package_len: u64,
    },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Package unavailable: {0}")]
    Io(String),
}

/// Handle table / resource bridge errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(i32),

    #[error("Resource limit exceeded")]
    ResourceLimit,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Would block")]
    WouldBlock,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => Self::WouldBlock,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Audio channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Initialization failure: {0}")]
    InitializationFailure(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, EmulatorError>;
