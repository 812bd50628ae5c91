//! Modbus/TCP Front-End (§4.6, §6.3). One thread accepts connections, and
//! one thread per accepted connection services requests from a thread pool,
//! adapted from the teacher crate's `server::modbus` module. Protocol
//! framing is entirely `rmodbus`'s; everything in this module is the
//! snapshot-then-writeback bridge between a Modbus frame and the process
//! image.
//!
//! # Register map (§6.3)
//!
//! | Modbus table        | Count | Maps to                              |
//! |----------------------|-------|---------------------------------------|
//! | Coils                | 58    | 0..6 = Q0..Q5, 6..58 = M0..M51        |
//! | Discrete inputs      | 3     | I0..I2                                 |
//! | Input registers      | 1     | unused, reserved                       |
//! | Holding registers    | 6     | scan_counter lo/hi, scan_time (tenths  |
//! |                      |       | of a ms), error_code, heartbeat lo,    |
//! |                      |       | emergency_stop                         |

use crate::image::SharedImage;
use log::{error, info};
use rmodbus::server::context::ModbusContext;
use rmodbus::server::ModbusFrame;
use rmodbus::{ModbusFrameBuf, ModbusProto};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use threadpool::ThreadPool;

const NUM_COILS: usize = crate::image::NUM_OUTPUTS + crate::image::NUM_MEMORY;
const NUM_DISCRETES: usize = crate::image::NUM_INPUTS;
const NUM_INPUT_REGS: usize = 1;
const NUM_HOLDING_REGS: usize = 6;

const HOLD_SCAN_COUNTER_LO: usize = 0;
const HOLD_SCAN_COUNTER_HI: usize = 1;
/// Scan time in tenths of a millisecond, clamped to 16 bits (§6.3).
const HOLD_SCAN_TIME_DS: usize = 2;
const HOLD_ERROR_CODE: usize = 3;
const HOLD_HEARTBEAT: usize = 4;
const HOLD_EMERGENCY_STOP: usize = 5;

type Ctx = ModbusContext<NUM_COILS, NUM_DISCRETES, NUM_INPUT_REGS, NUM_HOLDING_REGS>;

/// Shared Modbus server state: an `rmodbus` register context kept under a
/// lock, plus the process image it mirrors and the config store writes to
/// memory coils may need to validate against. Unlike the scan loop, this
/// context is *not* lock-free — it is only touched by one worker thread per
/// connection, each serialized behind this single lock, so request handling
/// throughput is bounded by contention here rather than by the image.
pub struct ModbusFront {
    ctx: parking_lot::RwLock<Ctx>,
    image: SharedImage,
}

impl ModbusFront {
    #[must_use]
    pub fn new(image: SharedImage) -> Self {
        Self {
            ctx: parking_lot::RwLock::new(ModbusContext::new()),
            image,
        }
    }

    /// Pulls the current process image into the register context ahead of
    /// processing a request, so reads never observe stale data (§6.3).
    fn sync_from_image(&self) {
        let mut ctx = self.ctx.write();
        for i in 0..crate::image::NUM_OUTPUTS {
            let v = self.image.outputs[i].load(Ordering::Relaxed);
            let _ = ctx.set_coil(i as u16, v);
        }
        for i in 0..crate::image::NUM_MEMORY {
            let v = self.image.memory[i].load(Ordering::Relaxed);
            let _ = ctx.set_coil((crate::image::NUM_OUTPUTS + i) as u16, v);
        }
        for i in 0..crate::image::NUM_INPUTS {
            let v = self.image.inputs[i].load(Ordering::Relaxed);
            let _ = ctx.set_discrete(i as u16, v);
        }
        let scan_counter = self.image.scan_counter.load(Ordering::Relaxed);
        let _ = ctx.set_holding(
            HOLD_SCAN_COUNTER_LO as u16,
            (scan_counter & 0xffff) as u16,
        );
        let _ = ctx.set_holding(
            HOLD_SCAN_COUNTER_HI as u16,
            ((scan_counter >> 16) & 0xffff) as u16,
        );
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scan_time_ds = (self.image.scan_time_us() / 100.0).min(f64::from(u16::MAX)) as u16;
        let _ = ctx.set_holding(HOLD_SCAN_TIME_DS as u16, scan_time_ds);
        let _ = ctx.set_holding(HOLD_ERROR_CODE as u16, self.image.error_code() as u16);
        let _ = ctx.set_holding(
            HOLD_HEARTBEAT as u16,
            (self.image.heartbeat.load(Ordering::Relaxed) & 0xffff) as u16,
        );
        let _ = ctx.set_holding(
            HOLD_EMERGENCY_STOP as u16,
            u16::from(self.image.emergency_stop.load(Ordering::Relaxed)),
        );
    }

    /// Applies any coil writes the request just made back into the process
    /// image. Q0..Q5 writes act exactly like an `OUTPUT` rung action;
    /// M0..M51 writes go through `write_memory`'s output-mirror gate, and
    /// M40..M45 writes additionally set the corresponding YOLO flag so a
    /// Modbus master can raise a YOLO level by writing its memory mirror
    /// coil directly (Design Notes open question #3).
    fn writeback_to_image(&self) {
        let ctx = self.ctx.read();
        for i in 0..crate::image::NUM_OUTPUTS {
            if let Ok(v) = ctx.get_coil(i as u16) {
                self.image.outputs[i].store(v, Ordering::Relaxed);
            }
        }
        self.image.mirror_outputs();
        for i in 0..crate::image::NUM_MEMORY {
            if let Ok(v) = ctx.get_coil((crate::image::NUM_OUTPUTS + i) as u16) {
                if crate::image::is_output_mirror_cell(i) {
                    continue;
                }
                self.image.write_memory(i, v);
                if (crate::image::MEM_YOLO_MIRROR_START
                    ..crate::image::MEM_YOLO_MIRROR_START + crate::image::MEM_YOLO_MIRROR_LEN)
                    .contains(&i)
                {
                    let level = i - crate::image::MEM_YOLO_MIRROR_START + 1;
                    self.image.set_yolo_flag(level, v);
                }
            }
        }
        // Holding registers (§6.3) are read-only projections of scan/error
        // state; emergency-stop can only be raised or cleared through the
        // programmatic API (§6.4), never by a Modbus master.
    }
}

fn handle_tcp_stream(
    stream: std::io::Result<std::net::TcpStream>,
    front: &ModbusFront,
    unit: u8,
    timeout: Duration,
) -> std::io::Result<()> {
    let mut stream = stream?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    loop {
        let mut buf: ModbusFrameBuf = [0; 256];
        let mut response = Vec::new();
        if stream.read(&mut buf).unwrap_or(0) == 0 {
            break;
        }
        front.sync_from_image();
        let mut frame = ModbusFrame::new(unit, &buf, ModbusProto::TcpUdp, &mut response);
        if frame.parse().is_err() {
            continue;
        }
        if frame.processing_required {
            let result = if frame.readonly {
                frame.process_read(&*front.ctx.read())
            } else {
                frame.process_write(&mut *front.ctx.write())
            };
            if result.is_err() {
                continue;
            }
            if !frame.readonly {
                front.writeback_to_image();
            }
        }
        if frame.response_required {
            if frame.finalize_response().is_err() {
                continue;
            }
            if stream.write(response.as_slice()).is_err() {
                break;
            }
        }
    }
    Ok(())
}

/// Runs the accept loop: one thread per connection, capped at `maxconn`
/// concurrently serviced connections via a thread pool (§6.3), exactly the
/// shape of the teacher's `tcp_server`.
///
/// # Errors
///
/// Returns an error if the listener cannot bind `listen`.
pub fn tcp_server(
    front: Arc<ModbusFront>,
    unit: u8,
    listen: &str,
    timeout: Duration,
    maxconn: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen)?;
    let pool = ThreadPool::new(maxconn);
    info!("modbus listener started at {listen}");
    for stream in listener.incoming() {
        let front = Arc::clone(&front);
        pool.execute(move || {
            if let Err(e) = handle_tcp_stream(stream, &front, unit, timeout) {
                error!("modbus connection error: {e}");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ProcessImage;

    fn leaked_image() -> SharedImage {
        let leaked: &'static ProcessImage = Box::leak(Box::new(ProcessImage::default()));
        unsafe { SharedImage::from_raw(leaked) }
    }

    #[test]
    fn sync_then_writeback_round_trips_output_coil() {
        let image = leaked_image();
        let front = ModbusFront::new(image);
        front.sync_from_image();
        {
            let mut ctx = front.ctx.write();
            ctx.set_coil(0, true).unwrap();
        }
        front.writeback_to_image();
        assert!(image.outputs[0].load(Ordering::Relaxed));
        assert!(image.memory[crate::image::MEM_OUTPUT_MIRROR_START].load(Ordering::Relaxed));
    }

    #[test]
    fn yolo_mirror_coil_write_sets_flag() {
        let image = leaked_image();
        let front = ModbusFront::new(image);
        front.sync_from_image();
        let mirror_coil = crate::image::NUM_OUTPUTS + crate::image::MEM_YOLO_MIRROR_START;
        {
            let mut ctx = front.ctx.write();
            ctx.set_coil(mirror_coil as u16, true).unwrap();
        }
        front.writeback_to_image();
        assert!(image.yolo_flags[0].load(Ordering::Relaxed));
    }

    #[test]
    fn holding_registers_reflect_scan_counter() {
        let image = leaked_image();
        image.scan_counter.store(0x0001_0002, Ordering::Relaxed);
        let front = ModbusFront::new(image);
        front.sync_from_image();
        let ctx = front.ctx.read();
        assert_eq!(ctx.get_holding(HOLD_SCAN_COUNTER_LO as u16).unwrap(), 2);
        assert_eq!(ctx.get_holding(HOLD_SCAN_COUNTER_HI as u16).unwrap(), 1);
    }
}
