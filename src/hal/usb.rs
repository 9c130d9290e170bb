// src/hal/usb.rs
//! USB backend contract
//!
//! The session treats USB as an opaque backend: it enumerates devices, opens
//! handles, and repeatedly calls [`UsbBackend::handle_events`] from its
//! background thread. Streaming transfers submitted through a [`UsbHandle`]
//! complete inside `handle_events`, so every [`StreamHandler`] callback runs
//! on that one thread.

use crate::config::UsbId;
use crate::error::UsbError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque identity of a physical device as enumerated by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbDeviceRef {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for UsbDeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Subset of the USB device descriptor the session needs for probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: UsbId,
    pub serial_index: u8,
}

/// Packet sizes of a bidirectional streaming transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub out_packet_size: usize,
    pub in_packet_size: usize,
}

/// What a stream wants after consuming an incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Continue,
    Done,
}

/// Direction of a hotplug notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

/// Receives hotplug notices. Backends may call it from any thread, but
/// never while holding a lock that `descriptor` or `open` needs.
pub type HotplugHandler = Arc<dyn Fn(UsbDeviceRef, HotplugEvent) + Send + Sync>;

/// Per-device transfer callbacks, invoked on the background I/O thread only.
pub trait StreamHandler: Send {
    /// Fill one outgoing packet before it is transmitted.
    fn fill_out(&mut self, packet: &mut [u8]);

    /// Consume one incoming packet.
    fn handle_in(&mut self, packet: &[u8]) -> StreamStatus;

    /// Called exactly once when the stream ends: `Ok` after `Done`, or the
    /// transfer status that ended it (including [`UsbError::Cancelled`]).
    fn finished(&mut self, status: Result<(), UsbError>);
}

/// Open connection to one device
pub trait UsbHandle: Send {
    fn serial_number(&mut self) -> Result<String, UsbError>;

    /// Control transfer; returns the number of bytes transferred.
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    /// Start streaming. Completion is driven by `UsbBackend::handle_events`.
    fn submit_stream(&mut self, config: StreamConfig, handler: Box<dyn StreamHandler>) -> Result<(), UsbError>;

    /// Cancel every stream submitted through this handle. Their handlers
    /// see `finished(Err(UsbError::Cancelled))` on the next event round.
    fn cancel_streams(&mut self) -> Result<(), UsbError>;
}

/// Process-level USB context
pub trait UsbBackend: Send + Sync {
    /// Create the backend context. Called once by `Session::new`.
    fn init(&self) -> Result<(), UsbError>;

    /// Tear the context down. Called once when the session is dropped.
    fn exit(&self);

    fn device_list(&self) -> Result<Vec<UsbDeviceRef>, UsbError>;

    fn descriptor(&self, device: UsbDeviceRef) -> Result<DeviceDescriptor, UsbError>;

    fn open(&self, device: UsbDeviceRef) -> Result<Box<dyn UsbHandle>, UsbError>;

    /// Process pending transfer completions, waiting at most `timeout`.
    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError>;

    /// Install or, with `None`, remove the hotplug handler. Backends that
    /// cannot report arrivals keep this default.
    fn set_hotplug_handler(&self, handler: Option<HotplugHandler>) -> Result<(), UsbError> {
        let _ = handler;
        Err(UsbError::NotSupported)
    }
}
