//! Seam to the guest CPU

use crate::app::AppId;
use crate::events::{KeyboardEvent, MessageEvent};
use om_core::error::EmulatorError;
use serde::Serialize;
use tracing::{debug, trace};

/// Everything the CPU needs to begin fetch-execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    /// Absolute guest address; bit 0 set for Thumb
    pub entry_point: u32,
    /// Guest address of the app's arena region
    pub base: u32,
    pub mem_size: u32,
    pub segments_size: u32,
}

/// What an app wants after its turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Exit,
}

/// Executes guest code on behalf of the manager
///
/// Every call is made from the manager loop thread.
pub trait GuestRuntime: Send {
    fn start(&mut self, app: AppId, context: &ExecutionContext) -> Result<(), EmulatorError>;

    /// Give `app` one cooperative time slice
    fn step(&mut self, app: AppId) -> StepOutcome;

    /// Invoke the app's registered key handler at `handler`
    fn deliver_key(&mut self, app: AppId, handler: u32, event: &KeyboardEvent);

    fn deliver_message(&mut self, app: AppId, event: &MessageEvent);

    fn on_terminate(&mut self, app: AppId);
}

/// Runtime that executes nothing
#[derive(Debug, Default)]
pub struct NullRuntime;

impl GuestRuntime for NullRuntime {
    fn start(&mut self, app: AppId, context: &ExecutionContext) -> Result<(), EmulatorError> {
        debug!("App {} ready at 0x{:08x}", app, context.entry_point);
        Ok(())
    }

    fn step(&mut self, _app: AppId) -> StepOutcome {
        StepOutcome::Continue
    }

    fn deliver_key(&mut self, app: AppId, handler: u32, event: &KeyboardEvent) {
        trace!("App {} key handler 0x{:08x}: {:?}", app, handler, event);
    }

    fn deliver_message(&mut self, app: AppId, event: &MessageEvent) {
        trace!("App {} message: {:?}", app, event);
    }

    fn on_terminate(&mut self, app: AppId) {
        debug!("App {} terminated", app);
    }
}
