//! Core runtime logic for oxidized-mre
//!
//! This crate provides the foundational error types, configuration,
//! and logging infrastructure shared by every other runtime crate.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{AudioError, EmulatorError, KernelError, LoaderError, MemoryError, Result};
