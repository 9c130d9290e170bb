// src/hal/traits.rs
//! Core HAL traits for device abstraction

use crate::error::DeviceError;
use crate::hal::types::{ChannelInfo, ChannelMode, DeviceInfo};
use crate::hal::usb::{DeviceDescriptor, UsbBackend, UsbDeviceRef};
use crate::session::RunContext;
use crate::signal::Signal;
use parking_lot::MappedMutexGuard;

/// One physical instrument.
///
/// Lifecycle: constructed by a [`DeviceDriver`] during discovery, then
/// `init()`; a device whose `init()` fails is never added to a session.
/// `added()` / `removed()` bracket its time in the active set, and
/// `on()` / `off()` bracket every run.
///
/// All methods except `init` take `&self`: the session shares devices with
/// callers and with the background I/O thread, so implementations use
/// interior mutability.
pub trait Device: Send + Sync {
    /// Backend identity this device was probed from
    fn usb_device(&self) -> UsbDeviceRef;

    fn info(&self) -> &DeviceInfo;

    fn channel_info(&self, channel: usize) -> Option<&ChannelInfo>;

    /// Borrow one signal for configuration or readback. The guard must be
    /// dropped before a run starts; the I/O thread needs the same lock.
    fn signal(&self, channel: usize, signal: usize) -> Option<MappedMutexGuard<'_, Signal>>;

    fn serial(&self) -> &str {
        &self.info().serial
    }

    fn set_mode(&self, channel: usize, mode: ChannelMode) -> Result<(), DeviceError> {
        let _ = (channel, mode);
        Ok(())
    }

    /// Open the USB connection and verify the device identity.
    fn init(&mut self, backend: &dyn UsbBackend) -> Result<(), DeviceError>;

    fn added(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn removed(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Apply a sample rate for the next run; returns the rate actually used.
    fn configure(&self, sample_rate: u64) -> Result<u64, DeviceError>;

    fn on(&self) -> Result<(), DeviceError>;

    fn off(&self) -> Result<(), DeviceError>;

    /// Hand a run of `nsamples` (0 = until cancelled) to the I/O thread.
    /// Must not block. The device reports back through `ctx` and must call
    /// [`RunContext::complete`] exactly once, including on failure.
    fn start_run(&self, nsamples: u64, ctx: RunContext) -> Result<(), DeviceError>;

    /// Abort the current run promptly, even if transfers are stalled.
    fn cancel(&self) -> Result<(), DeviceError>;
}

/// A hardware family: recognizes descriptors and builds devices for them.
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, descriptor: &DeviceDescriptor) -> bool;

    fn create(&self, usb_device: UsbDeviceRef, descriptor: &DeviceDescriptor) -> Box<dyn Device>;
}
