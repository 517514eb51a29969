//! App manager loop
//!
//! Owns every resident app and the two indices into them: the active
//! app, which receives input, and the current work app, whose turn it is
//! in the cooperative schedule. Both are plain ids and are cleared when
//! the app they name goes away.

use crate::app::{AppId, AppReport, AppResources, GuestApp};
use crate::dispatcher::Dispatcher;
use crate::events::LaunchRequest;
use crate::package::{FsPackageSource, PackageSource};
use crate::runtime::{GuestRuntime, StepOutcome};
use om_audio::{AudioBridge, DecoderFactory, SymphoniaDecoderFactory};
use om_core::config::{DrivesConfig, LimitsConfig};
use om_core::error::EmulatorError;
use om_core::Config;
use om_kernel::{FileBridge, HandleTable, SocketBridge, SocketConnector, TcpConnector};
use om_loader::{load_image, LoadOptions};
use om_memory::MemoryArena;
use parking_lot::MappedRwLockReadGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Host-side collaborators shared by every app
pub struct HostServices {
    pub arena: Arc<MemoryArena>,
    pub packages: Box<dyn PackageSource>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub connector: Arc<dyn SocketConnector>,
    pub load_options: LoadOptions,
    pub drives: DrivesConfig,
    pub limits: LimitsConfig,
    pub max_audio_channels: usize,
    /// Sleep between loop iterations in [`AppManager::run`]
    pub tick: Duration,
}

impl HostServices {
    /// Services backed by the host file system, network and codecs
    pub fn from_config(config: &Config) -> Result<Self, EmulatorError> {
        Ok(Self {
            arena: MemoryArena::new(config.memory.arena_size)?,
            packages: Box::new(FsPackageSource::new(&config.apps)),
            decoders: Arc::new(SymphoniaDecoderFactory),
            connector: Arc::new(TcpConnector::default()),
            load_options: LoadOptions {
                default_heap_size: config.memory.default_heap_size,
            },
            drives: config.drives.clone(),
            limits: config.limits.clone(),
            max_audio_channels: config.audio.max_channels,
            tick: Duration::from_millis(config.dispatcher.tick_ms),
        })
    }

    fn resources(&self) -> AppResources {
        AppResources::new(
            AudioBridge::new(self.decoders.clone(), self.max_audio_channels),
            FileBridge::new(self.drives.clone(), self.limits.max_files),
            SocketBridge::new(self.connector.clone(), self.limits.max_sockets),
        )
    }
}

/// Work done by one [`AppManager::run_once`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub launched: usize,
    pub failed: usize,
    pub keys: usize,
    pub messages: usize,
    pub exited: usize,
}

pub struct AppManager {
    dispatcher: Arc<Dispatcher>,
    services: HostServices,
    runtime: Box<dyn GuestRuntime>,
    apps: HandleTable<GuestApp>,
    active_app: Option<AppId>,
    current_work_app: Option<AppId>,
}

impl AppManager {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        services: HostServices,
        runtime: Box<dyn GuestRuntime>,
    ) -> Self {
        Self {
            dispatcher,
            services,
            runtime,
            apps: HandleTable::new("app"),
            active_app: None,
            current_work_app: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.services.arena
    }

    pub fn active_app(&self) -> Option<AppId> {
        self.active_app
    }

    pub fn current_work_app(&self) -> Option<AppId> {
        self.current_work_app
    }

    pub fn app(&self, id: AppId) -> Option<MappedRwLockReadGuard<'_, GuestApp>> {
        self.apps.access(id).ok()
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        self.apps.handles()
    }

    pub fn app_count(&self) -> usize {
        self.apps.active_count()
    }

    pub fn reports(&self) -> Vec<AppReport> {
        self.apps
            .handles()
            .into_iter()
            .filter_map(|id| self.app(id).map(|app| app.report(id)))
            .collect()
    }

    /// Bring an app to the foreground
    pub fn set_active_app(&mut self, id: AppId) -> Result<(), EmulatorError> {
        if !self.apps.is_active(id) {
            return Err(EmulatorError::AppNotFound(id.to_string()));
        }
        self.active_app = Some(id);
        debug!("Active app is now {}", id);
        Ok(())
    }

    /// Record the guest key callback of an app; 0 unregisters it
    pub fn register_key_handler(&self, id: AppId, addr: u32) -> Result<(), EmulatorError> {
        let mut app = self.apps.access_mut(id)?;
        app.set_key_handler(addr);
        Ok(())
    }

    /// Load one package and make it the active app
    pub fn launch(&mut self, request: &LaunchRequest) -> Result<AppId, EmulatorError> {
        let package = self.services.packages.fetch(request)?;
        let image = load_image(
            &package.bytes,
            &self.services.arena,
            &self.services.load_options,
        )?;

        let app = GuestApp::new(
            package.bytes,
            request.path.clone(),
            package.real_path,
            request.local,
            image,
            self.services.resources(),
        );
        let context = app.execution_context();
        let name = app.name();

        let id = self.apps.push(app)?;

        self.current_work_app = Some(id);
        if let Err(e) = self.runtime.start(id, &context) {
            self.apps.remove(id);
            self.current_work_app = None;
            return Err(e);
        }

        self.active_app = Some(id);
        info!(
            "Launched app {} '{}' from {} (entry 0x{:08x})",
            id,
            name,
            request.path.display(),
            context.entry_point
        );
        Ok(id)
    }

    /// Drain the launch queue
    ///
    /// Failed requests are logged and discarded.
    pub fn launch_apps(&mut self) -> (usize, usize) {
        let mut launched = 0;
        let mut failed = 0;

        for request in self.dispatcher.take_launches() {
            match self.launch(&request) {
                Ok(_) => launched += 1,
                Err(e) => {
                    warn!("Launch of {} failed: {}", request.path.display(), e);
                    failed += 1;
                }
            }
        }

        (launched, failed)
    }

    /// Deliver queued key events to the active app's key handler
    pub fn process_keyboard_events(&mut self) -> usize {
        let mut delivered = 0;

        for event in self.dispatcher.take_keyboard_events() {
            let Some(id) = self.active_app else {
                trace!("No active app for {:?}", event);
                continue;
            };
            let Some(handler) = self.app(id).and_then(|app| app.key_handler()) else {
                trace!("App {} has no key handler for {:?}", id, event);
                continue;
            };

            self.current_work_app = Some(id);
            self.runtime.deliver_key(id, handler, &event);
            delivered += 1;
        }

        delivered
    }

    /// Deliver queued messages to their target apps
    pub fn process_message_events(&mut self) -> usize {
        let mut delivered = 0;

        for event in self.dispatcher.take_message_events() {
            if !self.apps.is_active(event.target) {
                warn!(
                    "Dropping message 0x{:x} for missing app {}",
                    event.msg_id, event.target
                );
                continue;
            }

            self.current_work_app = Some(event.target);
            self.runtime.deliver_message(event.target, &event);
            delivered += 1;
        }

        delivered
    }

    /// Give every resident app one time slice
    pub fn step_apps(&mut self) -> usize {
        let mut exited = 0;

        for id in self.apps.handles() {
            self.current_work_app = Some(id);
            if self.runtime.step(id) == StepOutcome::Exit {
                self.terminate_app(id);
                exited += 1;
            }
        }

        exited
    }

    /// One pass of the manager loop
    pub fn run_once(&mut self) -> TickSummary {
        let (launched, failed) = self.launch_apps();
        let keys = self.process_keyboard_events();
        let messages = self.process_message_events();
        let exited = self.step_apps();

        TickSummary {
            launched,
            failed,
            keys,
            messages,
            exited,
        }
    }

    /// Run until `stop` is set, then shut down
    pub fn run(&mut self, stop: &AtomicBool) {
        info!("App manager running");
        while !stop.load(Ordering::Acquire) {
            self.run_once();
            std::thread::sleep(self.services.tick);
        }
        self.shutdown();
    }

    /// Remove an app, releasing its resources and memory
    pub fn terminate_app(&mut self, id: AppId) -> bool {
        let Some(app) = self.apps.remove(id) else {
            return false;
        };

        if self.active_app == Some(id) {
            self.active_app = None;
        }
        if self.current_work_app == Some(id) {
            self.current_work_app = None;
        }

        self.runtime.on_terminate(id);
        app.resources().teardown();
        info!("App {} '{}' terminated", id, app.name());
        true
    }

    /// Terminate every app and refuse further events
    pub fn shutdown(&mut self) {
        self.dispatcher.close();
        for id in self.apps.handles() {
            self.terminate_app(id);
        }
        info!("App manager stopped");
    }
}
