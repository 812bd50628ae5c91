//! The process image: a fixed-layout, `#[repr(C)]` block of individually
//! atomic cells shared between the supervisor, the worker's scan thread, and
//! the Modbus front-end. No cross-cell ordering is assumed anywhere in this
//! module — callers that need cycle-boundary consistency get it from the
//! scan loop's own sequencing (§5), not from anything here.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub const NUM_INPUTS: usize = 3;
pub const NUM_OUTPUTS: usize = 6;
pub const NUM_MEMORY: usize = 52;
pub const NUM_YOLO_FLAGS: usize = 10;
pub const NUM_TIMERS: usize = 10;
pub const NUM_COUNTERS: usize = 10;

/// M0..M38 are general-purpose; M39 is the YOLO-ready heartbeat; M40..M45
/// mirror the first six YOLO flags; M46..M51 mirror Q0..Q5 and are
/// read-only from external writers.
pub const MEM_YOLO_HEARTBEAT: usize = 39;
pub const MEM_YOLO_MIRROR_START: usize = 40;
pub const MEM_YOLO_MIRROR_LEN: usize = 6;
pub const MEM_OUTPUT_MIRROR_START: usize = 46;

#[inline]
#[must_use]
pub fn is_output_mirror_cell(index: usize) -> bool {
    (MEM_OUTPUT_MIRROR_START..MEM_OUTPUT_MIRROR_START + NUM_OUTPUTS).contains(&index)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    GpioInitFailed = 1,
    GpioReadTimeout = 2,
    ShmAccessFailed = 3,
    ConfigParseError = 4,
    ModbusInitFailed = 5,
    ScanTimeout = 6,
    WatchdogTimeout = 7,
    EmergencyStop = 8,
}

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
            1 => ErrorCode::GpioInitFailed,
            2 => ErrorCode::GpioReadTimeout,
            3 => ErrorCode::ShmAccessFailed,
            4 => ErrorCode::ConfigParseError,
            5 => ErrorCode::ModbusInitFailed,
            6 => ErrorCode::ScanTimeout,
            7 => ErrorCode::WatchdogTimeout,
            8 => ErrorCode::EmergencyStop,
            _ => ErrorCode::None,
        }
    }
}

/// One timer slot projected into the image for external visibility (§3.2).
#[derive(Default)]
#[repr(C)]
pub struct TimerCell {
    pub running: AtomicBool,
    pub done: AtomicBool,
    elapsed_bits: AtomicU64,
    preset_bits: AtomicU64,
}

impl TimerCell {
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        f64::from_bits(self.elapsed_bits.load(Ordering::Relaxed))
    }
    pub fn set_elapsed(&self, v: f64) {
        self.elapsed_bits.store(v.to_bits(), Ordering::Relaxed);
    }
    #[must_use]
    pub fn preset(&self) -> f64 {
        f64::from_bits(self.preset_bits.load(Ordering::Relaxed))
    }
    pub fn set_preset(&self, v: f64) {
        self.preset_bits.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// One counter slot projected into the image (§3.2).
#[derive(Default)]
#[repr(C)]
pub struct CounterCell {
    pub done: AtomicBool,
    pub count: AtomicU32,
    pub preset: AtomicU32,
}

/// The fixed-layout shared block. Every field is individually lock-free and
/// reader-safe; see §5 for the ordering guarantees this relies on.
#[repr(C)]
pub struct ProcessImage {
    pub inputs: [AtomicBool; NUM_INPUTS],
    pub outputs: [AtomicBool; NUM_OUTPUTS],
    pub memory: [AtomicBool; NUM_MEMORY],
    pub yolo_flags: [AtomicBool; NUM_YOLO_FLAGS],
    pub timers: [TimerCell; NUM_TIMERS],
    pub counters: [CounterCell; NUM_COUNTERS],
    pub scan_counter: AtomicU64,
    scan_time_us_bits: AtomicU64,
    error_code: AtomicU32,
    pub heartbeat: AtomicU32,
    pub emergency_stop: AtomicBool,
}

impl Default for ProcessImage {
    fn default() -> Self {
        Self {
            inputs: std::array::from_fn(|_| AtomicBool::new(false)),
            outputs: std::array::from_fn(|_| AtomicBool::new(false)),
            memory: std::array::from_fn(|_| AtomicBool::new(false)),
            yolo_flags: std::array::from_fn(|_| AtomicBool::new(false)),
            timers: std::array::from_fn(|_| TimerCell::default()),
            counters: std::array::from_fn(|_| CounterCell::default()),
            scan_counter: AtomicU64::new(0),
            scan_time_us_bits: AtomicU64::new(0f64.to_bits()),
            error_code: AtomicU32::new(ErrorCode::None as u32),
            heartbeat: AtomicU32::new(0),
            emergency_stop: AtomicBool::new(false),
        }
    }
}

impl ProcessImage {
    /// Writes a freshly initialized image into `dst`, which must point at a
    /// region at least `size_of::<ProcessImage>()` bytes long (the shared
    /// mapping). This replaces any prior contents unconditionally — callers
    /// must only do this once, before the worker forks.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `size_of::<ProcessImage>()` bytes
    /// and suitably aligned for `ProcessImage`.
    pub unsafe fn init_in_place(dst: *mut ProcessImage) {
        dst.write(ProcessImage::default());
    }

    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from(self.error_code.load(Ordering::Relaxed))
    }

    pub fn set_error_code(&self, code: ErrorCode) {
        self.error_code.store(code as u32, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scan_time_us(&self) -> f64 {
        f64::from_bits(self.scan_time_us_bits.load(Ordering::Relaxed))
    }

    pub fn set_scan_time_us(&self, v: f64) {
        self.scan_time_us_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Memory write gate: M46..M51 are the output mirror and are ignored
    /// from any writer other than `mirror_outputs` (§3.2, §4.1).
    pub fn write_memory(&self, index: usize, value: bool) {
        if index < NUM_MEMORY && !is_output_mirror_cell(index) {
            self.memory[index].store(value, Ordering::Relaxed);
        }
    }

    /// Step 6 of the scan cycle (§4.2): `memory[46+i] == outputs[i]`.
    pub fn mirror_outputs(&self) {
        for i in 0..NUM_OUTPUTS {
            let v = self.outputs[i].load(Ordering::Relaxed);
            self.memory[MEM_OUTPUT_MIRROR_START + i].store(v, Ordering::Relaxed);
        }
    }

    /// Sets a YOLO flag and refreshes its M40..M45 mirror in the same call,
    /// regardless of whether the write came from the programmatic API or a
    /// Modbus coil write (§3.2 invariant, Design Notes open question #3).
    ///
    /// # Panics
    ///
    /// Panics if `level` is not in `1..=10` — callers must validate first
    /// (the public `set_yolo_flag` API returns an error instead).
    pub fn set_yolo_flag(&self, level: usize, value: bool) {
        assert!((1..=NUM_YOLO_FLAGS).contains(&level), "yolo level OOB");
        self.yolo_flags[level - 1].store(value, Ordering::Relaxed);
        if level <= MEM_YOLO_MIRROR_LEN {
            self.memory[MEM_YOLO_MIRROR_START + level - 1].store(value, Ordering::Relaxed);
        }
    }

    /// Forces all outputs false and mirrors them, per the emergency-latch
    /// property (testable property #5) and scan-loop exit behavior (§4.4).
    pub fn force_outputs_low(&self) {
        for o in &self.outputs {
            o.store(false, Ordering::Relaxed);
        }
        self.mirror_outputs();
    }
}

/// A cheap, `Copy` handle to the process image living in the supervisor's
/// `MAP_SHARED` mapping. Every field of `ProcessImage` is independently
/// atomic, so `ProcessImage` is `Sync` and sharing `&'static ProcessImage`
/// across the worker's threads needs no reference counting — the mapping
/// outlives every thread that could hold a handle to it, since the worker
/// process only ever exits via `process::exit` after joining them all.
///
/// This exists instead of wrapping the raw pointer in an `Arc` because the
/// pointer does not come from an `Arc`-managed allocation: constructing an
/// `Arc` from it with `Arc::from_raw` would be unsound (mismatched
/// allocator/control-block expectations).
#[derive(Clone, Copy)]
pub struct SharedImage(&'static ProcessImage);

impl SharedImage {
    /// # Safety
    ///
    /// `ptr` must point to a `ProcessImage` already initialized by
    /// `init_in_place`, living in memory that remains mapped for as long as
    /// any `SharedImage` derived from it is in use.
    #[must_use]
    pub unsafe fn from_raw(ptr: *const ProcessImage) -> Self {
        Self(&*ptr)
    }
}

impl std::ops::Deref for SharedImage {
    type Target = ProcessImage;
    fn deref(&self) -> &ProcessImage {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_mirror_cells_are_read_only_targets() {
        assert!(is_output_mirror_cell(46));
        assert!(is_output_mirror_cell(51));
        assert!(!is_output_mirror_cell(45));
        assert!(!is_output_mirror_cell(52));
    }

    #[test]
    fn write_memory_ignores_output_mirror_range() {
        let img = ProcessImage::default();
        img.outputs[0].store(true, Ordering::Relaxed);
        img.mirror_outputs();
        img.write_memory(46, false);
        assert!(img.memory[46].load(Ordering::Relaxed));
    }

    #[test]
    fn yolo_flag_mirrors_into_memory() {
        let img = ProcessImage::default();
        img.set_yolo_flag(2, true);
        assert!(img.yolo_flags[1].load(Ordering::Relaxed));
        assert!(img.memory[MEM_YOLO_MIRROR_START + 1].load(Ordering::Relaxed));
    }

    #[test]
    fn force_outputs_low_clears_and_mirrors() {
        let img = ProcessImage::default();
        for o in &img.outputs {
            o.store(true, Ordering::Relaxed);
        }
        img.force_outputs_low();
        for i in 0..NUM_OUTPUTS {
            assert!(!img.outputs[i].load(Ordering::Relaxed));
            assert!(!img.memory[MEM_OUTPUT_MIRROR_START + i].load(Ordering::Relaxed));
        }
    }
}
