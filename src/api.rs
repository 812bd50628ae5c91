//! Programmatic API (§6.4): an in-process `PlcHandle` plus a local
//! Unix-domain-socket JSON protocol that mirrors it for out-of-process
//! callers, framed the same way as the teacher crate's `api.rs`
//! (1-byte reserved header + little-endian `u32` length prefix) but with
//! `serde_json` bodies instead of msgpack, since this crate has no
//! `eva_common` wire-format dependency to reuse.

use crate::config::ConfigStore;
use crate::error::{PlcError, PlcResult};
use crate::image::SharedImage;
use crate::scan::{ScanStats, ScanStatsSnapshot};
use log::error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use threadpool::ThreadPool;

const MAX_API_CONN: usize = 10;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process handle to a running worker, shared between the scan loop's
/// owner and anything embedding this crate as a library (§6.4).
#[derive(Clone)]
pub struct PlcHandle {
    image: SharedImage,
    config: Arc<ConfigStore>,
    unified_config_path: Option<PathBuf>,
    user_config_path: Option<PathBuf>,
    scan_stats: Arc<ScanStats>,
}

impl PlcHandle {
    #[must_use]
    pub fn new(
        image: SharedImage,
        config: Arc<ConfigStore>,
        unified_config_path: Option<PathBuf>,
        user_config_path: Option<PathBuf>,
        scan_stats: Arc<ScanStats>,
    ) -> Self {
        Self {
            image,
            config,
            unified_config_path,
            user_config_path,
            scan_stats,
        }
    }

    /// Rolling min/max/last/avg scan-cycle jitter (§4.4 expansion), read-only.
    #[must_use]
    pub fn get_scan_stats(&self) -> ScanStatsSnapshot {
        self.scan_stats.snapshot()
    }

    /// # Errors
    ///
    /// Returns an error if `level` is outside `1..=10`.
    pub fn set_yolo_flag(&self, level: usize, value: bool) -> PlcResult<()> {
        if !(1..=crate::image::NUM_YOLO_FLAGS).contains(&level) {
            return Err(PlcError::ConfigParseError(format!(
                "yolo level {level} out of range"
            )));
        }
        self.image.set_yolo_flag(level, value);
        Ok(())
    }

    #[must_use]
    pub fn get_output_status(&self, index: usize) -> Option<bool> {
        self.image
            .outputs
            .get(index)
            .map(|o| o.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn get_all_outputs(&self) -> Vec<bool> {
        self.image
            .outputs
            .iter()
            .map(|o| o.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns the memory cells `[start, start+len)`, clamped to the
    /// available range rather than erroring on an out-of-range request.
    #[must_use]
    pub fn get_memory_range(&self, start: usize, len: usize) -> Vec<bool> {
        let end = (start + len).min(crate::image::NUM_MEMORY);
        if start >= end {
            return Vec::new();
        }
        self.image.memory[start..end]
            .iter()
            .map(|m| m.load(Ordering::Relaxed))
            .collect()
    }

    /// Latches the emergency-stop flag; the scan loop and GPIO layer react
    /// on their own schedule (§3.2 emergency latch semantics).
    pub fn emergency_stop(&self) {
        self.image.emergency_stop.store(true, Ordering::Relaxed);
        self.image
            .set_error_code(crate::image::ErrorCode::EmergencyStop);
    }

    pub fn clear_emergency_stop(&self) {
        self.image.emergency_stop.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_emergency_stopped(&self) -> bool {
        self.image.emergency_stop.load(Ordering::Relaxed)
    }

    /// # Errors
    ///
    /// Returns an error if neither a unified nor a user config path was
    /// configured for this handle, or if the reload itself fails
    /// validation (§4.3: the prior configuration is left untouched).
    pub fn reload_user_config(&self) -> PlcResult<()> {
        match (&self.unified_config_path, &self.user_config_path) {
            (Some(u), Some(us)) => self.config.reload_user_config(u, us).map_err(Into::into),
            (Some(u), None) => self.config.load_unified(u).map_err(Into::into),
            (None, Some(us)) => self.config.load_user(us).map_err(Into::into),
            (None, None) => Err(PlcError::ConfigParseError(
                "no config path configured for reload".to_owned(),
            )),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Request {
    method: String,
    params: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn ok(v: serde_json::Value) -> Self {
        Self {
            result: Some(v),
            error: None,
        }
    }
    fn err(e: impl std::fmt::Display) -> Self {
        Self {
            result: None,
            error: Some(e.to_string()),
        }
    }
}

/// Binds the local API socket, removing a stale one from a previous run,
/// and spawns the accept loop in a background thread (§6.4).
///
/// # Panics
///
/// Panics if the socket path cannot be bound after a prior one is removed.
pub fn spawn_api(socket_path: &Path, handle: PlcHandle) {
    let _ = fs::remove_file(socket_path);
    let listener = unix::net::UnixListener::bind(socket_path)
        .unwrap_or_else(|e| panic!("failed to bind api socket {}: {e}", socket_path.display()));
    std::thread::Builder::new()
        .name("api".to_owned())
        .spawn(move || {
            let pool = ThreadPool::new(MAX_API_CONN);
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let handle = handle.clone();
                        pool.execute(move || {
                            if let Err(e) = handle_stream(stream, &handle) {
                                error!("api connection error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("api accept error: {e}"),
                }
            }
        })
        .expect("failed to spawn api thread");
}

fn handle_stream(mut stream: unix::net::UnixStream, handle: &PlcHandle) -> io::Result<()> {
    stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
    stream.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
    loop {
        let mut header = [0u8; 5];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(header[1..].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;

        let response = match serde_json::from_slice::<Request>(&body) {
            Ok(req) => dispatch(&req, handle),
            Err(e) => Response::err(e),
        };
        let packed = serde_json::to_vec(&response).unwrap_or_default();
        let mut out = Vec::with_capacity(packed.len() + 5);
        out.push(0u8);
        out.extend(u32::try_from(packed.len()).unwrap_or(0).to_le_bytes());
        out.extend(packed);
        stream.write_all(&out)?;
    }
    Ok(())
}

fn dispatch(req: &Request, handle: &PlcHandle) -> Response {
    match req.method.as_str() {
        "set_yolo_flag" => {
            #[derive(Deserialize)]
            struct P {
                level: usize,
                value: bool,
            }
            match req.params.clone().map(serde_json::from_value::<P>) {
                Some(Ok(p)) => match handle.set_yolo_flag(p.level, p.value) {
                    Ok(()) => Response::ok(serde_json::Value::Null),
                    Err(e) => Response::err(e),
                },
                _ => Response::err("invalid params"),
            }
        }
        "get_output_status" => {
            #[derive(Deserialize)]
            struct P {
                index: usize,
            }
            match req.params.clone().map(serde_json::from_value::<P>) {
                Some(Ok(p)) => Response::ok(serde_json::json!(handle.get_output_status(p.index))),
                _ => Response::err("invalid params"),
            }
        }
        "get_all_outputs" => Response::ok(serde_json::json!(handle.get_all_outputs())),
        "get_memory_range" => {
            #[derive(Deserialize)]
            struct P {
                start: usize,
                len: usize,
            }
            match req.params.clone().map(serde_json::from_value::<P>) {
                Some(Ok(p)) => {
                    Response::ok(serde_json::json!(handle.get_memory_range(p.start, p.len)))
                }
                _ => Response::err("invalid params"),
            }
        }
        "emergency_stop" => {
            handle.emergency_stop();
            Response::ok(serde_json::Value::Null)
        }
        "clear_emergency_stop" => {
            handle.clear_emergency_stop();
            Response::ok(serde_json::Value::Null)
        }
        "is_emergency_stopped" => Response::ok(serde_json::json!(handle.is_emergency_stopped())),
        "get_scan_stats" => {
            let s = handle.get_scan_stats();
            Response::ok(serde_json::json!({
                "count": s.count,
                "min_us": s.min_us,
                "max_us": s.max_us,
                "last_us": s.last_us,
                "avg_us": s.avg_us,
            }))
        }
        "reload_user_config" => match handle.reload_user_config() {
            Ok(()) => Response::ok(serde_json::Value::Null),
            Err(e) => Response::err(e),
        },
        other => Response::err(format!("unknown method: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn handle() -> PlcHandle {
        let leaked: &'static crate::image::ProcessImage =
            Box::leak(Box::new(crate::image::ProcessImage::default()));
        let image = unsafe { SharedImage::from_raw(leaked) };
        PlcHandle::new(
            image,
            Arc::new(ConfigStore::new()),
            None,
            None,
            Arc::new(ScanStats::default()),
        )
    }

    #[test]
    fn yolo_flag_out_of_range_errors() {
        let h = handle();
        assert!(h.set_yolo_flag(0, true).is_err());
        assert!(h.set_yolo_flag(11, true).is_err());
        assert!(h.set_yolo_flag(1, true).is_ok());
    }

    #[test]
    fn emergency_stop_round_trips() {
        let h = handle();
        assert!(!h.is_emergency_stopped());
        h.emergency_stop();
        assert!(h.is_emergency_stopped());
        h.clear_emergency_stop();
        assert!(!h.is_emergency_stopped());
    }

    #[test]
    fn reload_without_any_path_errors() {
        let h = handle();
        assert!(h.reload_user_config().is_err());
    }

    #[test]
    fn scan_stats_start_empty() {
        let h = handle();
        let s = h.get_scan_stats();
        assert_eq!(s.count, 0);
        assert_eq!(s.avg_us, 0);
    }

    #[test]
    fn memory_range_clamps_to_available_cells() {
        let h = handle();
        let v = h.get_memory_range(50, 10);
        assert_eq!(v.len(), crate::image::NUM_MEMORY - 50);
    }
}
