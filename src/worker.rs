//! Worker process wiring (§4.4, §5): the scan thread, an indicator blinker,
//! the watchdog monitor, and the optional Modbus acceptor thread, all
//! spun up inside the forked child and joined on shutdown. Analogous to the
//! teacher crate's `tasks.rs` thread lifecycle, but specific to this
//! runtime's fixed thread set rather than a generic task registry.

use crate::api::{self, PlcHandle};
use crate::config::ConfigStore;
use crate::error::PlcResult;
use crate::gpio::GpioLines;
use crate::image::{ErrorCode, SharedImage};
use crate::modbus::ModbusFront;
use crate::scan::{ScanLoop, ScanStats};
use crate::watchdog::Watchdog;
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Indicator blink period while M39 (the YOLO-ready heartbeat bit) is set —
/// a slow blink signals the vision process is actively re-asserting it (§5).
const INDICATOR_BLINK_PERIOD_YOLO_READY: Duration = Duration::from_secs(2);
/// Blink period while M39 is clear — a fast blink flags a YOLO-idle or
/// stalled-peer condition (§5).
const INDICATOR_BLINK_PERIOD_IDLE: Duration = Duration::from_millis(300);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const CONFIG_WATCHER_IDLE_PERIOD: Duration = Duration::from_secs(1);

pub struct ModbusConfig {
    pub listen: String,
    pub unit: u8,
    pub timeout: Duration,
    pub maxconn: usize,
}

pub struct WorkerConfig {
    pub modbus: Option<ModbusConfig>,
    pub watchdog_timeout: Duration,
    /// Local Unix-domain-socket path for the programmatic API (§6.4);
    /// disabled if `None`.
    pub api_socket: Option<PathBuf>,
    pub unified_config_path: Option<PathBuf>,
    pub user_config_path: Option<PathBuf>,
}

/// Runs the worker's full thread set and blocks until a shutdown signal
/// arrives or the scan loop itself halts. Returns an exit code suitable for
/// `std::process::exit` (§4.4: `0` on clean stop, non-zero otherwise).
///
/// # Safety
///
/// Must run inside the forked child process, after the shared image has
/// been initialized by the parent, and before any other thread touches
/// `image`.
pub fn run(
    image: SharedImage,
    config: Arc<ConfigStore>,
    gpio: Arc<dyn GpioLines>,
    cfg: WorkerConfig,
) -> i32 {
    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_flag::register(SIGTERM, Arc::clone(&stop)) {
        error!("failed to register SIGTERM handler: {e}");
    }
    if let Err(e) = signal_flag::register(SIGINT, Arc::clone(&stop)) {
        error!("failed to register SIGINT handler: {e}");
    }

    gpio.set_enable(true);

    // The default watchdog callback (§4.5, §7): latches emergency-stop and
    // forces GPIO to a safe state immediately, but does *not* ask the scan
    // loop to exit — per §7 the loop keeps running and driving outputs to
    // zero every cycle (via the latch checked in `ScanLoop::run_cycle`)
    // until `clear_emergency_stop()` is called through the API.
    let watchdog = Watchdog::new(cfg.watchdog_timeout);
    {
        let gpio = Arc::clone(&gpio);
        watchdog.set_callback(move || {
            error!("watchdog fired: scan loop unresponsive");
            image.set_error_code(ErrorCode::WatchdogTimeout);
            image.emergency_stop.store(true, Ordering::Relaxed);
            gpio.emergency_shutdown();
        });
    }
    watchdog.start();

    let mut handles = Vec::new();

    handles.push(spawn_indicator_blinker(image, Arc::clone(&gpio), Arc::clone(&stop)));
    handles.push(spawn_heartbeat(image, Arc::clone(&stop)));
    handles.push(spawn_config_watcher(Arc::clone(&stop)));

    if let Some(mb) = cfg.modbus {
        let front = Arc::new(ModbusFront::new(image));
        let listen = mb.listen.clone();
        thread::Builder::new()
            .name("modbus".to_owned())
            .spawn(move || {
                if let Err(e) = crate::modbus::tcp_server(front, mb.unit, &listen, mb.timeout, mb.maxconn)
                {
                    error!("modbus server error: {e}");
                }
            })
            .expect("failed to spawn modbus acceptor thread");
    }

    let scan_stats = Arc::new(ScanStats::default());

    if let Some(socket_path) = &cfg.api_socket {
        let handle = PlcHandle::new(
            image,
            Arc::clone(&config),
            cfg.unified_config_path.clone(),
            cfg.user_config_path.clone(),
            Arc::clone(&scan_stats),
        );
        api::spawn_api(socket_path, handle);
    }

    let mut scan = ScanLoop::with_stats(image, config, gpio, watchdog.clone(), scan_stats);
    scan.run(&stop);

    watchdog.stop();
    for h in handles.drain(..) {
        let _ = h.join();
    }

    info!("worker shutting down");
    if image.emergency_stop.load(Ordering::Relaxed) {
        1
    } else {
        0
    }
}

/// Toggles the indicator line while the worker runs (§5, §6.1): a 2-second
/// period while M39 (the YOLO-ready heartbeat bit) is set, a 300ms period
/// otherwise. An emergency-stop latch overrides the blink with the line's
/// safe state, matching `emergency_shutdown`'s own choice of `true`.
fn spawn_indicator_blinker(
    image: SharedImage,
    gpio: Arc<dyn GpioLines>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("indicator".to_owned())
        .spawn(move || {
            let mut on = false;
            while !stop.load(Ordering::Relaxed) {
                if image.emergency_stop.load(Ordering::Relaxed) {
                    gpio.set_indicator(true);
                    thread::sleep(INDICATOR_BLINK_PERIOD_IDLE);
                    continue;
                }
                on = !on;
                gpio.set_indicator(on);
                let yolo_ready = image.memory[crate::image::MEM_YOLO_HEARTBEAT]
                    .load(Ordering::Relaxed);
                let period = if yolo_ready {
                    INDICATOR_BLINK_PERIOD_YOLO_READY
                } else {
                    INDICATOR_BLINK_PERIOD_IDLE
                };
                thread::sleep(period);
            }
        })
        .expect("failed to spawn indicator thread")
}

/// 1 Hz heartbeat thread (§5): the sole writer of the image's `heartbeat`
/// cell, incremented independently of the scan counter so it stays
/// monotone across scan-counter wraparound and keeps advancing even if the
/// scan thread itself stalls short of a full watchdog timeout, giving the
/// supervisor's stall detector (§4.7) a signal distinct from scan health.
fn spawn_heartbeat(image: SharedImage, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("heartbeat".to_owned())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                image.heartbeat.fetch_add(1, Ordering::Relaxed);
                thread::sleep(HEARTBEAT_PERIOD);
            }
        })
        .expect("failed to spawn heartbeat thread")
}

/// Config watcher thread (§5): reserved for a future file-change-notify
/// reload trigger. Currently idle — it only polls the stop flag — since
/// reloads are driven through the programmatic API (`reload_user_config`)
/// rather than filesystem watching.
fn spawn_config_watcher(stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("config-watcher".to_owned())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(CONFIG_WATCHER_IDLE_PERIOD);
            }
        })
        .expect("failed to spawn config watcher thread")
}

/// Loads the system and user configuration files at startup (§4.3, §6.2).
/// A failure here is fatal — the worker has no rungs to evaluate safely.
pub fn load_initial_config(
    store: &ConfigStore,
    unified: Option<&std::path::Path>,
    system: Option<&std::path::Path>,
    user: Option<&std::path::Path>,
) -> PlcResult<()> {
    if let Some(path) = unified {
        store.load_unified(path)?;
        return Ok(());
    }
    if let Some(path) = system {
        store.load_system(path)?;
    }
    if let Some(path) = user {
        store.load_user(path)?;
    }
    Ok(())
}
