// src/hal/mod.rs
//! Hardware Abstraction Layer for source-measure devices

pub mod simulator;
pub mod smu_device;
pub mod traits;
pub mod types;
pub mod usb;

pub use simulator::{SimulatedBus, SimulatedDeviceSpec};
pub use smu_device::{SmuDevice, SmuDriver, SIGNAL_CURRENT, SIGNAL_VOLTAGE};
pub use traits::*;
pub use types::*;
pub use usb::*;
