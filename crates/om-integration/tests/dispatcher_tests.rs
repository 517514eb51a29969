//! App manager and dispatcher integration tests

use om_audio::testing::MockDecoderFactory;
use om_core::config::{DrivesConfig, LimitsConfig};
use om_core::error::{EmulatorError, LoaderError};
use om_integration::{
    AppFlags, AppId, AppManager, Dispatcher, ExecutionContext, GuestRuntime, HostServices,
    KeyboardEvent, LaunchRequest, MessageEvent, Package, PackageSource, StepOutcome,
};
use om_kernel::TcpConnector;
use om_loader::tags::tag;
use om_loader::{LoadOptions, PackageBuilder};
use om_memory::{MemoryArena, GUARD_PAGES, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Packages keyed by request path
#[derive(Default)]
struct MemoryPackages(HashMap<PathBuf, Vec<u8>>);

impl MemoryPackages {
    fn with(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.0.insert(PathBuf::from(path), bytes);
        self
    }
}

impl PackageSource for MemoryPackages {
    fn fetch(&self, request: &LaunchRequest) -> Result<Package, LoaderError> {
        let bytes = self
            .0
            .get(&request.path)
            .cloned()
            .ok_or_else(|| LoaderError::Io(format!("{} not found", request.path.display())))?;
        Ok(Package {
            bytes,
            real_path: PathBuf::from("/mem").join(&request.path),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Start(AppId, ExecutionContext),
    Key(AppId, u32, KeyboardEvent),
    Message(AppId, MessageEvent),
    Terminate(AppId),
}

/// Records every call; apps listed in `exit` leave on their next step
#[derive(Clone, Default)]
struct RecordingRuntime {
    calls: Arc<Mutex<Vec<Call>>>,
    exit: Arc<Mutex<Vec<AppId>>>,
    fail_start: Arc<AtomicBool>,
}

impl GuestRuntime for RecordingRuntime {
    fn start(&mut self, app: AppId, context: &ExecutionContext) -> Result<(), EmulatorError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EmulatorError::Runtime("no cpu".into()));
        }
        self.calls.lock().push(Call::Start(app, *context));
        Ok(())
    }

    fn step(&mut self, app: AppId) -> StepOutcome {
        if self.exit.lock().contains(&app) {
            StepOutcome::Exit
        } else {
            StepOutcome::Continue
        }
    }

    fn deliver_key(&mut self, app: AppId, handler: u32, event: &KeyboardEvent) {
        self.calls.lock().push(Call::Key(app, handler, *event));
    }

    fn deliver_message(&mut self, app: AppId, event: &MessageEvent) {
        self.calls.lock().push(Call::Message(app, *event));
    }

    fn on_terminate(&mut self, app: AppId) {
        self.calls.lock().push(Call::Terminate(app));
    }
}

fn package(name: &str) -> Vec<u8> {
    PackageBuilder::new()
        .entry(0x8001)
        .segment(0x8000, vec![0xE1u8; 0x400])
        .resources(b"RESOURCES".to_vec())
        .name(name)
        .tag_u32(tag::RAM_KB, 32)
        .build()
}

fn manager(packages: MemoryPackages) -> (AppManager, RecordingRuntime) {
    let services = HostServices {
        arena: MemoryArena::new(4 * 1024 * 1024).unwrap(),
        packages: Box::new(packages),
        decoders: Arc::new(MockDecoderFactory::new(100)),
        connector: Arc::new(TcpConnector::default()),
        load_options: LoadOptions {
            default_heap_size: 64 * 1024,
        },
        drives: DrivesConfig::default(),
        limits: LimitsConfig::default(),
        max_audio_channels: 4,
        tick: Duration::from_millis(1),
    };
    let runtime = RecordingRuntime::default();
    let manager = AppManager::new(
        Arc::new(Dispatcher::new()),
        services,
        Box::new(runtime.clone()),
    );
    (manager, runtime)
}

#[test]
fn test_launch_exposes_execution_context() {
    let packages = MemoryPackages::default().with("clock.vxp", package("Clock"));
    let (mut mgr, runtime) = manager(packages);

    assert!(mgr.dispatcher().add_app_for_launch("clock.vxp", true));
    let summary = mgr.run_once();
    assert_eq!(summary.launched, 1);
    assert_eq!(summary.failed, 0);

    let id = mgr.active_app().unwrap();
    let app = mgr.app(id).unwrap();
    let ctx = app.execution_context();

    assert_eq!(ctx.entry_point, ctx.base + 1);
    assert_eq!(ctx.segments_size, 0x400);
    assert_eq!(ctx.mem_size, PAGE_SIZE + 32 * 1024);
    assert_eq!(app.resource_blob(), b"RESOURCES");
    assert_eq!(app.name(), "Clock");
    assert!(app.flags().contains(AppFlags::LOCAL));
    assert!(!app.flags().contains(AppFlags::ZIPPED));
    drop(app);

    assert_eq!(runtime.calls.lock()[0], Call::Start(id, ctx));

    let reports = mgr.reports();
    assert_eq!(reports.len(), 1);
    let json = serde_json::to_value(&reports[0]).unwrap();
    assert_eq!(json["name"], "Clock");
    assert_eq!(json["context"]["segments_size"], 0x400);
}

#[test]
fn test_malformed_launch_is_discarded() {
    let mut junk = package("Junk");
    junk[18] = 0x03; // EM_386
    let packages = MemoryPackages::default()
        .with("junk.vxp", junk)
        .with("good.vxp", package("Good"));
    let (mut mgr, _) = manager(packages);

    let d = mgr.dispatcher().clone();
    d.add_app_for_launch("junk.vxp", false);
    d.add_app_for_launch("missing.vxp", false);
    d.add_app_for_launch("good.vxp", false);

    let summary = mgr.run_once();
    assert_eq!(summary.launched, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(mgr.app_count(), 1);
    assert_eq!(mgr.arena().region_count(), 1);

    // The loop keeps serving events after the failures
    d.add_message_event(mgr.active_app().unwrap(), 0x10, 1, 2, -1);
    assert_eq!(mgr.run_once().messages, 1);
}

#[test]
fn test_keys_go_to_active_app_with_handler() {
    let packages = MemoryPackages::default()
        .with("a.vxp", package("A"))
        .with("b.vxp", package("B"));
    let (mut mgr, runtime) = manager(packages);
    let d = mgr.dispatcher().clone();

    d.add_app_for_launch("a.vxp", false);
    mgr.run_once();
    let a = mgr.active_app().unwrap();
    d.add_app_for_launch("b.vxp", false);
    mgr.run_once();
    let b = mgr.active_app().unwrap();
    assert_ne!(a, b);

    // No handler registered yet
    d.add_keyboard_event(1, 35);
    assert_eq!(mgr.run_once().keys, 0);

    mgr.register_key_handler(a, 0x9000).unwrap();
    d.add_keyboard_event(1, 36);
    assert_eq!(mgr.run_once().keys, 0);

    mgr.set_active_app(a).unwrap();
    d.add_keyboard_event(1, 37);
    d.add_keyboard_event(2, 37);
    assert_eq!(mgr.process_keyboard_events(), 2);
    assert_eq!(mgr.current_work_app(), Some(a));

    let keys: Vec<_> = runtime
        .calls
        .lock()
        .iter()
        .filter_map(|c| match c {
            Call::Key(id, handler, ev) => Some((*id, *handler, ev.event, ev.keycode)),
            _ => None,
        })
        .collect();
    assert_eq!(keys, vec![(a, 0x9000, 1, 37), (a, 0x9000, 2, 37)]);

    assert!(matches!(
        mgr.set_active_app(99),
        Err(EmulatorError::AppNotFound(_))
    ));
}

#[test]
fn test_messages_to_missing_apps_are_dropped() {
    let packages = MemoryPackages::default().with("a.vxp", package("A"));
    let (mut mgr, runtime) = manager(packages);
    let d = mgr.dispatcher().clone();

    d.add_app_for_launch("a.vxp", false);
    mgr.run_once();
    let a = mgr.active_app().unwrap();

    d.add_message_event(a + 5, 1, 0, 0, a);
    d.add_message_event(a, 2, 3, 4, -1);
    assert_eq!(mgr.process_message_events(), 1);

    let messages: Vec<_> = runtime
        .calls
        .lock()
        .iter()
        .filter_map(|c| match c {
            Call::Message(id, ev) => Some((*id, ev.msg_id)),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec![(a, 2)]);
}

#[test]
fn test_indices_invalidated_on_removal() {
    let packages = MemoryPackages::default().with("a.vxp", package("A"));
    let (mut mgr, runtime) = manager(packages);
    let d = mgr.dispatcher().clone();

    d.add_app_for_launch("a.vxp", false);
    mgr.run_once();
    let a = mgr.active_app().unwrap();
    assert_eq!(mgr.current_work_app(), Some(a));

    {
        let app = mgr.app(a).unwrap();
        app.resources().audio.play_bytes(0x100, b"tune", 0, 0).unwrap();
    }

    runtime.exit.lock().push(a);
    let summary = mgr.run_once();
    assert_eq!(summary.exited, 1);

    assert_eq!(mgr.active_app(), None);
    assert_eq!(mgr.current_work_app(), None);
    assert!(mgr.app(a).is_none());
    assert!(!mgr.terminate_app(a));
    assert!(runtime.calls.lock().contains(&Call::Terminate(a)));

    assert_eq!(mgr.arena().region_count(), 0);
    assert_eq!(mgr.arena().used(), GUARD_PAGES * PAGE_SIZE);
}

#[test]
fn test_failed_start_releases_app() {
    let packages = MemoryPackages::default().with("a.vxp", package("A"));
    let (mut mgr, runtime) = manager(packages);
    runtime.fail_start.store(true, Ordering::SeqCst);

    mgr.dispatcher().add_app_for_launch("a.vxp", false);
    let summary = mgr.run_once();
    assert_eq!(summary.failed, 1);
    assert_eq!(mgr.app_count(), 0);
    assert_eq!(mgr.active_app(), None);
    assert_eq!(mgr.arena().region_count(), 0);
}

#[test]
fn test_out_of_memory_spares_resident_apps() {
    let big = PackageBuilder::new()
        .entry(0x8000)
        .segment(0x8000, vec![0u8; 0x100])
        .tag_u32(tag::RAM_KB, 16 * 1024)
        .build();
    let packages = MemoryPackages::default()
        .with("a.vxp", package("A"))
        .with("big.vxp", big);
    let (mut mgr, _) = manager(packages);
    let d = mgr.dispatcher().clone();

    d.add_app_for_launch("a.vxp", false);
    mgr.run_once();
    let a = mgr.active_app().unwrap();

    d.add_app_for_launch("big.vxp", false);
    let summary = mgr.run_once();
    assert_eq!(summary.failed, 1);
    assert_eq!(mgr.active_app(), Some(a));
    assert_eq!(mgr.app_ids(), vec![a]);
}

#[test]
fn test_concurrent_producers_keep_fifo() {
    const PER_THREAD: i32 = 500;
    let packages = MemoryPackages::default().with("a.vxp", package("A"));
    let (mut mgr, runtime) = manager(packages);
    let d = mgr.dispatcher().clone();

    d.add_app_for_launch("a.vxp", false);
    mgr.run_once();
    let a = mgr.active_app().unwrap();
    mgr.register_key_handler(a, 0x8100).unwrap();

    crossbeam::scope(|s| {
        for producer in 0..4 {
            let d = &d;
            s.spawn(move |_| {
                for seq in 0..PER_THREAD {
                    assert!(d.add_keyboard_event(producer, seq));
                    assert!(d.add_message_event(a, producer as u32, seq, 0, -1));
                }
            });
        }
        s.spawn(|_| {
            for _ in 0..50 {
                mgr.run_once();
            }
        });
    })
    .unwrap();
    mgr.run_once();

    let calls = runtime.calls.lock();
    for producer in 0..4 {
        let keys: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Key(_, _, ev) if ev.event == producer => Some(ev.keycode),
                _ => None,
            })
            .collect();
        let messages: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Message(_, ev) if ev.msg_id == producer as u32 => Some(ev.wparam),
                _ => None,
            })
            .collect();

        let expected: Vec<_> = (0..PER_THREAD).collect();
        assert_eq!(keys, expected);
        assert_eq!(messages, expected);
    }
}

#[test]
fn test_run_stops_and_shuts_down() {
    let packages = MemoryPackages::default().with("a.vxp", package("A"));
    let (mut mgr, _) = manager(packages);
    let d = mgr.dispatcher().clone();
    d.add_app_for_launch("a.vxp", false);

    let stop = AtomicBool::new(false);
    crossbeam::scope(|s| {
        s.spawn(|_| mgr.run(&stop));
        s.spawn(|_| {
            while d.pending().0 > 0 {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(20));
            stop.store(true, Ordering::Release);
        });
    })
    .unwrap();

    assert!(d.is_closed());
    assert_eq!(mgr.app_count(), 0);
    assert_eq!(mgr.arena().region_count(), 0);
    assert!(!d.add_app_for_launch("a.vxp", false));
}
