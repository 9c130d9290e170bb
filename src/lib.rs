//! SMU-Core: session and signal engine for USB source-measure units
//!
//! This library drives USB-attached signal generation/acquisition devices
//! and routes every sample tick between hardware and user code. It features:
//!
//! - A [`Session`] owning discovery, activation and run control
//! - A background I/O thread that is the only caller of per-sample code
//! - Per-channel [`Signal`]s with waveform, buffer and callback sources
//!   and buffer or callback sinks
//! - A pluggable USB backend contract plus an in-process simulated bus
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use smu_core::hal::{ChannelMode, SimulatedBus, SimulatedDeviceSpec, SIGNAL_VOLTAGE};
//! use smu_core::config::{SessionConfig, UsbId};
//! use smu_core::Session;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = SimulatedBus::with_devices([
//!         SimulatedDeviceSpec::new(UsbId::new(0x0456, 0xcee2), "DEMO0001"),
//!     ]);
//!     let session = Session::new(Arc::new(bus), SessionConfig::default())?;
//!
//!     session.update_available_devices()?;
//!     let device = session.available_devices().remove(0);
//!     session.add_device(&device)?;
//!     session.configure(100_000);
//!
//!     device.set_mode(0, ChannelMode::Svmi)?;
//!     if let Some(mut signal) = device.signal(0, SIGNAL_VOLTAGE) {
//!         signal.source_sine(2.5, 1.0, 100.0, 0.0)?;
//!         signal.measure_buffer(1000);
//!     }
//!
//!     let outcome = session.run(1000)?;
//!     println!("run finished: {:?}", outcome);
//!
//!     let captured = device.signal(0, SIGNAL_VOLTAGE).and_then(|mut s| s.take_captured());
//!     println!("captured {} samples", captured.map_or(0, |c| c.len()));
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hal;
pub mod session;
pub mod signal;

// Re-export commonly used types for convenience
pub use config::{ConfigLoader, SessionConfig, UsbId};
pub use error::{ConfigError, DeviceError, SignalError, SmuError, SmuResult, UsbError};
pub use hal::{ChannelMode, Device, DeviceDriver, DeviceInfo, SignalInfo, UsbBackend};
pub use session::{RunContext, RunOutcome, Session};
pub use signal::{Signal, SourceKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: "Session and signal engine for USB source-measure units".to_string(),
        features: vec![
            "Device discovery and activation".to_string(),
            "Background USB I/O thread".to_string(),
            "Waveform, buffer and callback sources".to_string(),
            "Buffer and callback sinks".to_string(),
            "Simulated loopback bus".to_string(),
        ],
    }
}

/// Library version information
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Library name
    pub name: String,
    /// Version string
    pub version: String,
    /// Description
    pub description: String,
    /// List of features
    pub features: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        let info = version_info();
        assert_eq!(info.name, NAME);
        assert_eq!(info.version, VERSION);
        assert!(!info.features.is_empty());
    }

    #[test]
    fn test_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "smu-core");
    }
}
