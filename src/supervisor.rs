//! Supervisor/worker process model (§4.4, §5). The supervisor maps the
//! shared process image before forking so the worker inherits it already
//! mapped `MAP_SHARED`, then watches the worker's heartbeat cell and
//! escalates `SIGTERM` to `SIGKILL` if it stalls or fails to exit, matching
//! `original_source/plc_cpp/src/main.cpp`'s fork-and-supervise loop.

use crate::gpio::GpioLines;
use crate::image::ProcessImage;
use log::{error, info, warn};
use memmap2::MmapMut;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Allocates the anonymous `MAP_SHARED` region the process image lives in.
/// Must be called before `fork()`: the mapping is inherited read/write
/// shared by the child, which is how the two processes share one image
/// without a named POSIX shm object (Design Notes: anonymous mmap over
/// `shm_open`, see SPEC_FULL.md).
///
/// # Errors
///
/// Returns an error if the underlying `mmap` call fails.
pub fn create_shared_image() -> std::io::Result<MmapMut> {
    MmapMut::map_anon(std::mem::size_of::<ProcessImage>())
}

/// # Safety
///
/// `map` must be at least `size_of::<ProcessImage>()` bytes and not yet
/// have a `ProcessImage` written into it by any other call.
pub unsafe fn init_image(map: &mut MmapMut) -> *mut ProcessImage {
    let ptr = map.as_mut_ptr().cast::<ProcessImage>();
    ProcessImage::init_in_place(ptr);
    ptr
}

/// Result of running the supervisor: whether the worker it launched exited
/// cleanly (used as the process exit status by `main`).
pub enum Outcome {
    WorkerExitedCleanly,
    WorkerExitedWithError,
    WorkerKilled,
}

/// Forks, runs `worker_fn` in the child, and supervises it from the parent.
/// `image` is the same `MAP_SHARED` mapping `worker_fn` is expected to run
/// the scan loop against — since the mapping predates `fork()`, the
/// supervisor observes the worker's heartbeat writes directly with no IPC
/// of its own. `emergency_gpio` is used by the supervisor (not the worker)
/// to force a safe state on any abnormal exit path (§4.4).
///
/// # Safety
///
/// Must be called before any other thread is spawned in this process —
/// `fork()` only duplicates the calling thread, and anything already
/// running in other threads is simply gone in the child. `image` must
/// point into the shared mapping initialized by `init_image`.
pub unsafe fn run<F>(image: *const ProcessImage, emergency_gpio: &dyn GpioLines, worker_fn: F) -> Outcome
where
    F: FnOnce() -> i32,
{
    match fork() {
        Ok(ForkResult::Child) => {
            let code = worker_fn();
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            let stop = Arc::new(AtomicBool::new(false));
            if let Err(e) = signal_flag::register(SIGTERM, Arc::clone(&stop)) {
                error!("failed to register supervisor SIGTERM handler: {e}");
            }
            if let Err(e) = signal_flag::register(SIGINT, Arc::clone(&stop)) {
                error!("failed to register supervisor SIGINT handler: {e}");
            }
            supervise(child, &*image, emergency_gpio, &stop)
        }
        Err(e) => {
            error!("fork failed: {e}");
            emergency_gpio.emergency_shutdown();
            Outcome::WorkerExitedWithError
        }
    }
}

fn supervise(
    child: Pid,
    image: &ProcessImage,
    emergency_gpio: &dyn GpioLines,
    stop: &AtomicBool,
) -> Outcome {
    info!("supervisor started, watching worker pid {child}");
    thread::sleep(Duration::from_millis(100));

    let mut last_change = Instant::now();
    let mut last_heartbeat = image.heartbeat.load(Ordering::Relaxed);

    let outcome = loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, status)) => {
                if status == 0 {
                    info!("worker exited cleanly");
                    break Outcome::WorkerExitedCleanly;
                }
                warn!("worker exited with status {status}");
                break Outcome::WorkerExitedWithError;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                warn!("worker killed by signal {sig:?}");
                break Outcome::WorkerKilled;
            }
            Ok(_) => {}
            Err(e) => {
                error!("waitpid failed: {e}");
                break Outcome::WorkerExitedWithError;
            }
        }

        if stop.load(Ordering::Relaxed) {
            info!("supervisor received termination signal, forwarding to worker");
            terminate_with_grace(child);
            break Outcome::WorkerKilled;
        }

        thread::sleep(POLL_INTERVAL);

        let current = image.heartbeat.load(Ordering::Relaxed);
        if current == last_heartbeat {
            if last_change.elapsed() >= HEARTBEAT_TIMEOUT {
                error!("worker heartbeat stalled, sending SIGKILL");
                let _ = signal::kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                break Outcome::WorkerKilled;
            }
        } else {
            last_heartbeat = current;
            last_change = Instant::now();
        }
    };

    // §4.7: the supervisor always performs the emergency shutdown primitive
    // on its own exit path, regardless of whether the worker terminated
    // normally or was forced — it never trusts the worker's own attempt.
    if matches!(outcome, Outcome::WorkerExitedCleanly) {
        info!("performing emergency shutdown after clean worker exit");
    } else {
        error!("performing emergency shutdown");
    }
    emergency_gpio.emergency_shutdown();
    outcome
}

/// Sends `SIGTERM`, waits up to `GRACE_PERIOD` for the worker to exit, and
/// escalates to `SIGKILL` if it doesn't (§4.4 shutdown sequence).
pub fn terminate_with_grace(child: Pid) {
    let _ = signal::kill(child, Signal::SIGTERM);
    let deadline = Instant::now() + GRACE_PERIOD;
    while Instant::now() < deadline {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return,
            _ => thread::sleep(Duration::from_millis(100)),
        }
    }
    warn!("worker did not exit within grace period, sending SIGKILL");
    let _ = signal::kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_image_round_trips_a_write() {
        let mut map = create_shared_image().unwrap();
        unsafe {
            let ptr = init_image(&mut map);
            (*ptr).scan_counter.store(42, Ordering::Relaxed);
            assert_eq!((*ptr).scan_counter.load(Ordering::Relaxed), 42);
        }
    }
}
