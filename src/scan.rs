//! The Scan Loop (§4.2, §4.4): the fixed-period 8-step cycle that is the
//! heart of the worker process.

use crate::config::ConfigStore;
use crate::counters::CounterBank;
use crate::evaluator::{self, CycleSets};
use crate::gpio::GpioLines;
use crate::image::SharedImage;
use crate::timers::TimerBank;
use crate::watchdog::Watchdog;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SCAN_PERIOD: Duration = Duration::from_millis(20);

/// Point-in-time view of `ScanStats`, in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct ScanStatsSnapshot {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub last_us: u64,
    pub avg_us: u64,
}

/// Rolling min/max/last/avg cycle-time counters, read-only through the
/// programmatic API — the same bookkeeping the teacher's `tasks::ThreadStats`
/// keeps for each of its own loops, narrowed to the one scan thread this
/// runtime has.
#[derive(Default)]
pub struct ScanStats {
    count: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
    last_us: AtomicU64,
    sum_us: AtomicU64,
}

impl ScanStats {
    fn record(&self, elapsed: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let us = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last_us.store(us, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        // fetch_min/fetch_max start from 0, so the first sample needs a
        // nudge: 0 is a spurious floor no real cycle will beat.
        if self.count.load(Ordering::Relaxed) == 1 {
            self.min_us.store(us, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed);
        ScanStatsSnapshot {
            count,
            min_us: self.min_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
            last_us: self.last_us.load(Ordering::Relaxed),
            avg_us: if count == 0 { 0 } else { sum / count },
        }
    }
}

/// Safety-net window (§4.2 step 7): if the external system stops toggling
/// the YOLO heartbeat cell (M39) for this long, the worker clears every
/// YOLO flag rather than trust a possibly-dead peer's last-known levels.
const YOLO_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts to request the `SCHED_RR` real-time scheduling class for the
/// calling thread at the given priority. Failure is logged and otherwise
/// ignored (§4.4): a missing `CAP_SYS_NICE` must not prevent the scan loop
/// from running, only degrade its timing guarantees.
pub fn request_realtime_priority(priority: i32) {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
            warn!(
                "failed to set SCHED_RR priority {priority}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Pins the calling thread to a single CPU core, read from `PLC_SCAN_CPU`
/// (§4.4's affinity knob, the scan-loop equivalent of the teacher's
/// per-thread `PLC_THREAD_AFFINITY_*` variables). Absent or malformed, this
/// is a no-op: CPU pinning is an optional determinism aid, not a
/// requirement for the loop to run.
pub fn request_cpu_affinity() {
    let Ok(raw) = std::env::var("PLC_SCAN_CPU") else {
        return;
    };
    let Ok(id) = raw.parse::<usize>() else {
        warn!("PLC_SCAN_CPU={raw:?} is not a valid core index, ignoring");
        return;
    };
    let core = core_affinity::CoreId { id };
    if core_affinity::set_for_current(core) {
        info!("pinned scan thread to CPU {id}");
    } else {
        warn!("failed to pin scan thread to CPU {id}");
    }
}

/// Drives the scan loop until `stop` is set, then drives outputs low and
/// asks `gpio` to shut down safely before returning (§4.4).
pub struct ScanLoop {
    image: SharedImage,
    config: Arc<ConfigStore>,
    gpio: Arc<dyn GpioLines>,
    watchdog: Watchdog,
    timers: TimerBank,
    counters: CounterBank,
    timer_enable: HashSet<String>,
    counter_trigger: HashSet<String>,
    last_yolo_heartbeat: bool,
    last_yolo_change: Instant,
    stats: Arc<ScanStats>,
}

impl ScanLoop {
    #[must_use]
    pub fn new(
        image: SharedImage,
        config: Arc<ConfigStore>,
        gpio: Arc<dyn GpioLines>,
        watchdog: Watchdog,
    ) -> Self {
        Self::with_stats(image, config, gpio, watchdog, Arc::new(ScanStats::default()))
    }

    /// Like `new`, but shares an existing `ScanStats` handle — used when the
    /// worker wants to read jitter stats back out through the programmatic
    /// API (§6.4 expansion).
    #[must_use]
    pub fn with_stats(
        image: SharedImage,
        config: Arc<ConfigStore>,
        gpio: Arc<dyn GpioLines>,
        watchdog: Watchdog,
        stats: Arc<ScanStats>,
    ) -> Self {
        let (_, timer_configs, counter_configs) = config.snapshot();
        let mut timers = TimerBank::new();
        for t in &timer_configs {
            let _ = timers.add(&t.name, t.preset);
        }
        let mut counters = CounterBank::new();
        for c in &counter_configs {
            let _ = counters.add(&c.name, c.preset);
        }
        Self {
            image,
            config,
            gpio,
            watchdog,
            timers,
            counters,
            timer_enable: HashSet::new(),
            counter_trigger: HashSet::new(),
            last_yolo_heartbeat: false,
            last_yolo_change: Instant::now(),
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ScanStats> {
        Arc::clone(&self.stats)
    }

    /// Runs one full cycle (§4.2 steps 1-8). Returns the cycle's wall-clock
    /// duration so the caller can detect overruns.
    pub fn run_cycle(&mut self) -> Duration {
        let cycle_start = Instant::now();
        let now = Instant::now();

        // Step 1: sample inputs.
        let inputs: Vec<bool> = (0..crate::image::NUM_INPUTS)
            .map(|i| {
                let v = self.gpio.read_input(i);
                self.image.inputs[i].store(v, Ordering::Relaxed);
                v
            })
            .collect();

        // Step 2: timers consume the *previous* cycle's enable set.
        self.timers.update(&self.image, now, &self.timer_enable);

        // Step 3: counters consume the *previous* cycle's trigger set.
        self.counters.update(&self.image, &self.counter_trigger);

        // Step 4: evaluate rungs, producing the *next* cycle's sets.
        let (rungs, _, _) = self.config.snapshot();
        let CycleSets {
            timer_enable,
            counter_trigger,
        } = evaluator::run_cycle(&rungs, &inputs, &self.image, &mut self.timers, &mut self.counters);
        self.timer_enable = timer_enable;
        self.counter_trigger = counter_trigger;

        // Step 5: commit outputs to GPIO. If emergency-stop is latched,
        // every output is forced false before the commit regardless of what
        // the evaluator just wrote (§3.2 invariant, testable property #5) —
        // the latch holds until `clear_emergency_stop()` is called, the scan
        // loop itself keeps running.
        if self.image.emergency_stop.load(Ordering::Relaxed) {
            self.image.force_outputs_low();
        }
        for i in 0..crate::image::NUM_OUTPUTS {
            let v = self.image.outputs[i].load(Ordering::Relaxed);
            self.gpio.write_output(i, v);
        }

        // Step 6: mirror outputs to memory.
        self.image.mirror_outputs();

        // Step 7: periodic YOLO heartbeat safety net.
        self.service_yolo_heartbeat(now);

        // Step 8: record scan time/counter, feed the watchdog, publish. The
        // heartbeat cell itself is owned by the worker's dedicated 1 Hz
        // heartbeat thread (§5), not this loop, so it stays monotone across
        // scan-counter wraparound instead of being derived from it.
        self.watchdog.feed();
        self.image.scan_counter.fetch_add(1, Ordering::Relaxed);
        let elapsed = cycle_start.elapsed();
        #[allow(clippy::cast_precision_loss)]
        self.image
            .set_scan_time_us(elapsed.as_micros() as f64);
        self.stats.record(elapsed);
        elapsed
    }

    fn service_yolo_heartbeat(&mut self, now: Instant) {
        let current = self.image.memory[crate::image::MEM_YOLO_HEARTBEAT].load(Ordering::Relaxed);
        if current != self.last_yolo_heartbeat {
            self.last_yolo_heartbeat = current;
            self.last_yolo_change = now;
            return;
        }
        if now.duration_since(self.last_yolo_change) >= YOLO_HEARTBEAT_TIMEOUT {
            for level in 1..=crate::image::NUM_YOLO_FLAGS {
                self.image.set_yolo_flag(level, false);
            }
            // Reset so this does not re-fire every cycle (mirrors the
            // watchdog's own re-arm behavior).
            self.last_yolo_change = now;
        }
    }

    /// Runs the fixed-period loop until `stop` is observed, pacing each
    /// iteration to `SCAN_PERIOD` and logging (but not aborting on) overruns.
    /// On exit, drives every output low and hands the GPIO lines to
    /// `emergency_shutdown` before returning (§4.4).
    pub fn run(&mut self, stop: &AtomicBool) {
        request_realtime_priority(10);
        request_cpu_affinity();
        let mut next_tick = Instant::now() + SCAN_PERIOD;
        while !stop.load(Ordering::Relaxed) {
            let elapsed = self.run_cycle();
            if elapsed > SCAN_PERIOD {
                warn!(
                    "scan cycle overran period: {:?} > {:?}",
                    elapsed, SCAN_PERIOD
                );
                self.image.set_error_code(crate::image::ErrorCode::ScanTimeout);
            }
            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep(next_tick - now);
                next_tick += SCAN_PERIOD;
            } else {
                next_tick = now + SCAN_PERIOD;
            }
        }
        self.image.force_outputs_low();
        self.gpio.emergency_shutdown();
        error!("scan loop stopped, outputs forced low");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimGpio;

    fn harness() -> (ScanLoop, SharedImage, Arc<SimGpio>) {
        let leaked: &'static crate::image::ProcessImage =
            Box::leak(Box::new(crate::image::ProcessImage::default()));
        let image = unsafe { SharedImage::from_raw(leaked) };
        let config = Arc::new(ConfigStore::new());
        let gpio = Arc::new(SimGpio::new());
        let wd = Watchdog::new(Duration::from_secs(5));
        let scan = ScanLoop::new(image, config, gpio.clone() as Arc<dyn GpioLines>, wd);
        (scan, image, gpio)
    }

    #[test]
    fn scan_counter_increments_each_cycle() {
        let (mut scan, image, _gpio) = harness();
        scan.run_cycle();
        scan.run_cycle();
        assert_eq!(image.scan_counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn yolo_flags_cleared_after_heartbeat_stall() {
        let (mut scan, image, _gpio) = harness();
        image.set_yolo_flag(1, true);
        let now = Instant::now();
        scan.last_yolo_change = now - YOLO_HEARTBEAT_TIMEOUT - Duration::from_secs(1);
        scan.service_yolo_heartbeat(now);
        assert!(!image.yolo_flags[0].load(Ordering::Relaxed));
    }

    #[test]
    fn inputs_are_mirrored_from_gpio() {
        let (mut scan, image, gpio) = harness();
        gpio.set_input(0, true);
        scan.run_cycle();
        assert!(image.inputs[0].load(Ordering::Relaxed));
    }

    #[test]
    fn scan_stats_accumulate_across_cycles() {
        let (mut scan, _image, _gpio) = harness();
        scan.run_cycle();
        scan.run_cycle();
        scan.run_cycle();
        let snap = scan.stats().snapshot();
        assert_eq!(snap.count, 3);
        assert!(snap.min_us <= snap.avg_us);
        assert!(snap.avg_us <= snap.max_us);
    }
}
