// src/error.rs
//! Unified error handling for SMU Core
//!
//! Errors are split by the layer that produces them:
//!
//! - [`UsbError`]: status codes from the USB backend (enumeration, open, transfers)
//! - [`DeviceError`]: a single device refusing or failing an operation
//! - [`ConfigError`]: configuration loading and validation
//! - [`SmuError`]: the session-level error every public session call returns
//!
//! Device-level failures are recoverable: the session records them and keeps
//! going with the remaining devices. Only backend context creation is fatal.

use thiserror::Error;

/// Status reported by a USB backend.
///
/// The numeric codes follow the libusb convention so that backends wrapping
/// a C library can map their return values directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("backend error {0}")]
    Other(i32),
}

impl UsbError {
    /// Map a negative libusb-style status code to an error.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => UsbError::Io,
            -2 => UsbError::InvalidParam,
            -3 => UsbError::Access,
            -4 => UsbError::NoDevice,
            -5 => UsbError::NotFound,
            -6 => UsbError::Busy,
            -7 => UsbError::Timeout,
            -8 => UsbError::Overflow,
            -9 => UsbError::Pipe,
            -10 => UsbError::Interrupted,
            -11 => UsbError::NoMem,
            -12 => UsbError::NotSupported,
            // LIBUSB_TRANSFER_CANCELLED lives in the transfer status space
            3 => UsbError::Cancelled,
            other => UsbError::Other(other),
        }
    }

    /// Negative status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            UsbError::Io => -1,
            UsbError::InvalidParam => -2,
            UsbError::Access => -3,
            UsbError::NoDevice => -4,
            UsbError::NotFound => -5,
            UsbError::Busy => -6,
            UsbError::Timeout => -7,
            UsbError::Overflow => -8,
            UsbError::Pipe => -9,
            UsbError::Interrupted => -10,
            UsbError::NoMem => -11,
            UsbError::NotSupported => -12,
            UsbError::Cancelled => 3,
            UsbError::Other(code) => *code,
        }
    }

    /// A cancelled transfer completing is not an error condition.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, UsbError::Cancelled)
    }
}

/// Failure of a single device operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("failed to open device: {0}")]
    Open(UsbError),
    #[error("device identity check failed for {vendor_id:04x}:{product_id:04x}")]
    Identity { vendor_id: u16, product_id: u16 },
    #[error("device is not open")]
    NotOpen,
    #[error("sample rate {requested} Hz outside supported range {min}..={max} Hz")]
    UnsupportedRate { requested: u64, min: u64, max: u64 },
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
    #[error("device is not powered on")]
    NotPowered,
    #[error("a run is already in progress")]
    Busy,
    #[error("transfer failed: {0}")]
    Transfer(UsbError),
}

impl From<UsbError> for DeviceError {
    fn from(err: UsbError) -> Self {
        DeviceError::Transfer(err)
    }
}

/// Rejected source/sink configuration on a [`crate::signal::Signal`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("period must be finite and greater than 0, got {0}")]
    InvalidPeriod(f64),
    #[error("phase must be finite, got {0}")]
    InvalidPhase(f64),
    #[error("source buffer is empty")]
    EmptyBuffer,
    #[error("the configured source has no period")]
    NotPeriodic,
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-level error.
#[derive(Debug, Error)]
pub enum SmuError {
    /// Backend context could not be created or enumeration failed.
    #[error("usb backend error: {0}")]
    Backend(#[from] UsbError),

    /// A device operation failed.
    #[error("device {serial}: {source}")]
    Device {
        serial: String,
        #[source]
        source: DeviceError,
    },

    /// The device is not known to the session, or not in the required state.
    #[error("device {0} is not available")]
    DeviceNotAvailable(String),

    /// The device is already part of the active set.
    #[error("device {0} is already active")]
    DeviceAlreadyActive(String),

    /// Device set changes are not allowed while a run is in progress.
    #[error("a run is in progress")]
    RunInProgress,

    /// Starting a run with no active devices.
    #[error("no active devices")]
    NoDevices,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A session thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SmuError {
    pub(crate) fn device(serial: &str, source: DeviceError) -> Self {
        SmuError::Device { serial: serial.to_string(), source }
    }
}

/// Result type alias for session operations
pub type SmuResult<T> = Result<T, SmuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_code_round_trip_for_known_codes() {
        for code in -12..=-1 {
            assert_eq!(UsbError::from_code(code).code(), code);
        }
        assert_eq!(UsbError::from_code(-99), UsbError::Other(-99));
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        assert!(UsbError::Cancelled.is_cancellation());
        assert!(!UsbError::Pipe.is_cancellation());
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::UnsupportedRate { requested: 5, min: 1000, max: 100_000 };
        let display = err.to_string();
        assert!(display.contains("5 Hz"));
        assert!(display.contains("1000..=100000"));
    }

    #[test]
    fn test_smu_error_preserves_source() {
        use std::error::Error;

        let err = SmuError::device("ABC123", DeviceError::Transfer(UsbError::Pipe));
        assert!(err.to_string().contains("ABC123"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SmuError>();
        assert_send_sync::<DeviceError>();
    }
}
