//! Error taxonomy for the scan engine, mirrored 1:1 onto the process image's
//! `error_code` cell (see `image::ErrorCode`).

use thiserror::Error;

pub type PlcResult<T> = Result<T, PlcError>;

#[derive(Debug, Error)]
pub enum PlcError {
    #[error("gpio init failed: {0}")]
    GpioInitFailed(String),

    #[error("gpio read timeout on line {0}")]
    GpioReadTimeout(usize),

    #[error("shared process image unavailable: {0}")]
    ShmAccessFailed(String),

    #[error("config parse error: {0}")]
    ConfigParseError(String),

    #[error("modbus init failed: {0}")]
    ModbusInitFailed(String),

    #[error("scan cycle exceeded the scan period: {0:?}")]
    ScanTimeout(std::time::Duration),

    #[error("watchdog timeout after {0:?}")]
    WatchdogTimeout(std::time::Duration),

    #[error("emergency stop latched")]
    EmergencyStop,
}

impl PlcError {
    /// The stable numeric code written into the process image, per §7.
    #[must_use]
    pub fn code(&self) -> crate::image::ErrorCode {
        use crate::image::ErrorCode;
        match self {
            PlcError::GpioInitFailed(_) => ErrorCode::GpioInitFailed,
            PlcError::GpioReadTimeout(_) => ErrorCode::GpioReadTimeout,
            PlcError::ShmAccessFailed(_) => ErrorCode::ShmAccessFailed,
            PlcError::ConfigParseError(_) => ErrorCode::ConfigParseError,
            PlcError::ModbusInitFailed(_) => ErrorCode::ModbusInitFailed,
            PlcError::ScanTimeout(_) => ErrorCode::ScanTimeout,
            PlcError::WatchdogTimeout(_) => ErrorCode::WatchdogTimeout,
            PlcError::EmergencyStop => ErrorCode::EmergencyStop,
        }
    }

    /// Initialization anomalies are fatal to the worker (§7 propagation policy).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlcError::GpioInitFailed(_)
                | PlcError::ShmAccessFailed(_)
                | PlcError::ConfigParseError(_)
                | PlcError::ModbusInitFailed(_)
        )
    }
}
