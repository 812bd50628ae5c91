//! Soft-real-time ladder-logic PLC scan engine (see SPEC_FULL.md).
//!
//! The crate is split along the worker's own seams: `image` is the shared
//! process image, `config` is the reload-safe rung/timer/counter store,
//! `evaluator` is the pure per-cycle ladder logic, `timers`/`counters` are
//! the stateful banks the evaluator drives, `scan` ties all of that into
//! the fixed-period loop, `gpio` is the hardware seam, `modbus` is the
//! fieldbus front-end, `supervisor`/`worker` are the two halves of the
//! forked process model, and `api` is the programmatic interface.

use log::debug;
use once_cell::sync::OnceCell;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod api;
pub mod config;
pub mod counters;
pub mod error;
pub mod evaluator;
pub mod gpio;
pub mod image;
pub mod modbus;
pub mod scan;
pub mod supervisor;
pub mod timers;
pub mod watchdog;
pub mod worker;

pub mod prelude {
    pub use crate::error::{PlcError, PlcResult};
    pub use crate::image::ProcessImage;
    pub use log::{debug, error, info, trace, warn};
}

static STARTUP_TIME: OnceCell<Instant> = OnceCell::new();
static HOSTNAME: OnceCell<String> = OnceCell::new();

/// Initializes logging exactly as the teacher crate does: stdout via
/// `env_logger` by default, or local syslog when `SYSLOG=1` is set, with
/// verbosity controlled by `VERBOSE=1` (§7, ambient logging stack).
///
/// # Panics
///
/// Panics if `SYSLOG=1` is set but the local syslog socket cannot be
/// reached.
pub fn init_logging() {
    HOSTNAME
        .set(hostname::get().map_or_else(
            |_| "unknown".to_owned(),
            |h| h.to_string_lossy().to_string(),
        ))
        .ok();
    STARTUP_TIME.set(Instant::now()).ok();
    let verbose = env::var("VERBOSE").ok().map_or(false, |v| v == "1");
    let syslog_enabled = env::var("SYSLOG").ok().map_or(false, |v| v == "1");
    if syslog_enabled {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "ladderscan".to_owned(),
            pid: std::process::id(),
        };
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
            syslog::unix(formatter).expect("failed to connect to local syslog"),
        )))
        .expect("failed to install syslog logger");
        log::set_max_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    } else {
        env_logger::Builder::new()
            .target(env_logger::Target::Stdout)
            .filter_level(if verbose {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            })
            .init();
    }
    debug!("log initialization completed");
}

#[must_use]
pub fn hostname() -> &'static str {
    HOSTNAME.get().map_or("unknown", String::as_str)
}

#[must_use]
pub fn uptime() -> std::time::Duration {
    STARTUP_TIME.get().map_or(std::time::Duration::ZERO, Instant::elapsed)
}

/// Default var/run directory for the pid file and API socket, overridable
/// via `PLC_VAR_DIR` (mirrors the teacher crate's `var_dir`).
#[must_use]
pub fn var_dir() -> PathBuf {
    env::var("PLC_VAR_DIR").map_or_else(|_| env::temp_dir(), |p| Path::new(&p).to_owned())
}
