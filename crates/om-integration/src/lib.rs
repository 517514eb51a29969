//! App manager for oxidized-mre
//!
//! Host threads enqueue launch requests, key presses and inter-app
//! messages on a [`Dispatcher`]. A single [`AppManager`] loop drains the
//! queues, loads guest packages and hands work to the CPU runtime.

pub mod app;
pub mod dispatcher;
pub mod events;
pub mod manager;
pub mod package;
pub mod runtime;

pub use app::{AppFlags, AppId, AppReport, AppResources, GuestApp};
pub use dispatcher::Dispatcher;
pub use events::{KeyboardEvent, LaunchRequest, MessageEvent};
pub use manager::{AppManager, HostServices, TickSummary};
pub use package::{FsPackageSource, Package, PackageSource};
pub use runtime::{ExecutionContext, GuestRuntime, NullRuntime, StepOutcome};
