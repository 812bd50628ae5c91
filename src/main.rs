//! Entry point: parses CLI arguments, then forks into the supervisor/worker
//! pair described in §4.4 and SPEC_FULL.md's process model section.

use clap::Parser;
use ladderscan::config::ConfigStore;
use ladderscan::gpio::{GpioLines, SimGpio};
use ladderscan::image::SharedImage;
use ladderscan::worker::{self, ModbusConfig, WorkerConfig};
use ladderscan::{supervisor, var_dir};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Soft-real-time ladder-logic PLC scan engine for single-board Linux controllers.
#[derive(Parser, Debug)]
#[command(name = "ladderscan", version)]
struct Cli {
    /// Unified configuration file (timers, counters, and rungs in one file).
    #[arg(short = 'c', long = "unified")]
    unified: Option<PathBuf>,

    /// Split-mode system configuration file (rungs only).
    #[arg(short = 's', long = "system")]
    system: Option<PathBuf>,

    /// Split-mode user configuration file (timers, counters, rungs).
    #[arg(short = 'u', long = "user")]
    user: Option<PathBuf>,

    /// Modbus/TCP listen address, e.g. 0.0.0.0:502. Disabled if omitted.
    #[arg(long = "modbus-listen")]
    modbus_listen: Option<String>,

    /// Modbus unit id.
    #[arg(long = "modbus-unit", default_value_t = 1)]
    modbus_unit: u8,

    /// Modbus per-connection max concurrent connections.
    #[arg(long = "modbus-maxconn", default_value_t = 5)]
    modbus_maxconn: usize,

    /// Watchdog timeout in seconds; floored at 5s regardless of this value.
    #[arg(long = "watchdog-secs", default_value_t = 5)]
    watchdog_secs: u64,

    /// Local programmatic API socket path. Disabled if set to an empty string.
    #[arg(long = "api-socket")]
    api_socket: Option<PathBuf>,
}

fn main() {
    ladderscan::init_logging();
    let cli = Cli::parse();

    let mut shared = match supervisor::create_shared_image() {
        Ok(m) => m,
        Err(e) => {
            error!("failed to allocate shared process image: {e}");
            std::process::exit(1);
        }
    };
    // SAFETY: the mapping was just created and nothing else has touched it.
    let image_ptr = unsafe { supervisor::init_image(&mut shared) };
    // SAFETY: `init_image` just finished initializing the pointee above.
    let config_image = unsafe { SharedImage::from_raw(image_ptr.cast_const()) };

    let config = Arc::new(ConfigStore::with_image(config_image));
    if let Err(e) = worker::load_initial_config(
        &config,
        cli.unified.as_deref(),
        cli.system.as_deref(),
        cli.user.as_deref(),
    ) {
        error!("failed to load initial configuration: {e}");
        std::process::exit(1);
    }
    let cli_unified = cli.unified.clone();
    let cli_user = cli.user.clone();

    let emergency_gpio: Arc<dyn GpioLines> = Arc::new(SimGpio::new());

    let modbus_cfg = cli.modbus_listen.map(|listen| ModbusConfig {
        listen,
        unit: cli.modbus_unit,
        timeout: Duration::from_secs(2),
        maxconn: cli.modbus_maxconn,
    });
    let watchdog_timeout = Duration::from_secs(cli.watchdog_secs);
    let api_socket = Some(
        cli.api_socket
            .unwrap_or_else(|| var_dir().join("ladderscan.sock")),
    );

    info!("starting ladderscan, var_dir={}", var_dir().display());

    // SAFETY: fork happens before any other thread is spawned in this
    // process; `image_ptr` points into the shared mapping created above,
    // which the worker closure's `shared` (inherited via fork, never
    // dropped since the child exits through `process::exit`) keeps mapped
    // for the rest of the child's lifetime.
    let outcome = unsafe {
        supervisor::run(image_ptr.cast_const(), &*emergency_gpio, move || {
            let _keep_mapped = &shared;
            let image = SharedImage::from_raw(image_ptr.cast_const());

            let gpio: Arc<dyn GpioLines> = Arc::new(SimGpio::new());
            let worker_cfg = WorkerConfig {
                modbus: modbus_cfg,
                watchdog_timeout,
                api_socket,
                unified_config_path: cli_unified,
                user_config_path: cli_user,
            };
            worker::run(image, config, gpio, worker_cfg)
        })
    };

    match outcome {
        supervisor::Outcome::WorkerExitedCleanly => std::process::exit(0),
        supervisor::Outcome::WorkerExitedWithError | supervisor::Outcome::WorkerKilled => {
            std::process::exit(1)
        }
    }
}
