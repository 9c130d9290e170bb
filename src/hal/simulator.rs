// src/hal/simulator.rs
//! Simulated USB bus with loopback hardware
//!
//! Every simulated device echoes each outgoing stream packet back as the
//! next incoming packet, so whatever a signal sources is what it measures.
//! Faults can be injected per device: failing `open`, stalled streams,
//! and transfer errors after a number of packets. `plug` and `unplug`
//! report hotplug notices on the calling thread.

use crate::config::UsbId;
use crate::error::UsbError;
use crate::hal::usb::{
    DeviceDescriptor, HotplugEvent, HotplugHandler, StreamConfig, StreamHandler, StreamStatus, UsbBackend,
    UsbDeviceRef, UsbHandle,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const SIM_BUS: u8 = 1;

/// Vendor request returning a version string (index 0 = hardware, 1 = firmware)
pub const REQ_GET_VERSION: u8 = 0x00;

/// Simulated physical device
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDeviceSpec {
    pub id: UsbId,
    pub serial: String,
    pub hw_version: String,
    pub fw_version: String,
    pub fail_open: bool,
    pub stalled: bool,
    pub fail_after_packets: Option<u64>,
}

impl SimulatedDeviceSpec {
    pub fn new(id: UsbId, serial: impl Into<String>) -> Self {
        Self {
            id,
            serial: serial.into(),
            hw_version: "F".to_string(),
            fw_version: "2.17".to_string(),
            fail_open: false,
            stalled: false,
            fail_after_packets: None,
        }
    }

    /// `open()` fails with [`UsbError::Access`]
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Streams are accepted but never make progress
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Streams fail with [`UsbError::Pipe`] after `packets` packets
    pub fn failing_after(mut self, packets: u64) -> Self {
        self.fail_after_packets = Some(packets);
        self
    }
}

struct ActiveStream {
    slot: usize,
    handler: Box<dyn StreamHandler>,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
    cancel: Arc<AtomicBool>,
    packets: u64,
}

#[derive(Default)]
struct BusInner {
    slots: Mutex<Vec<Option<SimulatedDeviceSpec>>>,
    streams: Mutex<Vec<ActiveStream>>,
    hotplug: Mutex<Option<HotplugHandler>>,
    initialized: AtomicBool,
    fail_init: AtomicBool,
    fail_enumeration: AtomicBool,
    event_rounds: AtomicU64,
    packets: AtomicU64,
}

impl BusInner {
    fn spec(&self, slot: usize) -> Option<SimulatedDeviceSpec> {
        self.slots.lock().get(slot).cloned().flatten()
    }

    fn notify(&self, device: UsbDeviceRef, event: HotplugEvent) {
        let handler = self.hotplug.lock().clone();
        if let Some(handler) = handler {
            trace!(%device, ?event, "hotplug notice");
            handler(device, event);
        }
    }
}

/// In-process [`UsbBackend`]. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    inner: Arc<BusInner>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(specs: impl IntoIterator<Item = SimulatedDeviceSpec>) -> Self {
        let bus = Self::new();
        for spec in specs {
            bus.plug(spec);
        }
        bus
    }

    /// Attach a device; returns its bus address
    pub fn plug(&self, spec: SimulatedDeviceSpec) -> UsbDeviceRef {
        let device = {
            let mut slots = self.inner.slots.lock();
            slots.push(Some(spec));
            Self::slot_ref(slots.len() - 1)
        };
        self.inner.notify(device, HotplugEvent::Arrived);
        device
    }

    /// Detach a device. Its open streams fail with [`UsbError::NoDevice`].
    pub fn unplug(&self, device: UsbDeviceRef) -> bool {
        let removed = match Self::slot_index(device) {
            Some(slot) => self.inner.slots.lock().get_mut(slot).and_then(Option::take).is_some(),
            None => false,
        };
        if removed {
            self.inner.notify(device, HotplugEvent::Left);
        }
        removed
    }

    /// Make the next `init()` fail, as a missing USB subsystem would
    pub fn set_init_failure(&self, fail: bool) {
        self.inner.fail_init.store(fail, Ordering::Relaxed);
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        self.inner.fail_enumeration.store(fail, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Number of `handle_events` calls so far
    pub fn event_rounds(&self) -> u64 {
        self.inner.event_rounds.load(Ordering::Relaxed)
    }

    /// Total stream packets looped back
    pub fn packets_transferred(&self) -> u64 {
        self.inner.packets.load(Ordering::Relaxed)
    }

    fn slot_ref(slot: usize) -> UsbDeviceRef {
        UsbDeviceRef { bus: SIM_BUS, address: (slot + 1) as u8 }
    }

    fn slot_index(device: UsbDeviceRef) -> Option<usize> {
        if device.bus == SIM_BUS && device.address > 0 {
            Some(device.address as usize - 1)
        } else {
            None
        }
    }

    fn lookup(&self, device: UsbDeviceRef) -> Result<(usize, SimulatedDeviceSpec), UsbError> {
        let slot = Self::slot_index(device).ok_or(UsbError::NoDevice)?;
        let spec = self.inner.spec(slot).ok_or(UsbError::NoDevice)?;
        Ok((slot, spec))
    }

    /// Service one stream for one packet. Returns the stream if it continues.
    fn service(&self, mut stream: ActiveStream) -> Option<ActiveStream> {
        if stream.cancel.load(Ordering::Acquire) {
            stream.handler.finished(Err(UsbError::Cancelled));
            return None;
        }

        let spec = match self.inner.spec(stream.slot) {
            Some(spec) => spec,
            None => {
                stream.handler.finished(Err(UsbError::NoDevice));
                return None;
            }
        };

        if spec.stalled {
            return Some(stream);
        }

        if spec.fail_after_packets.is_some_and(|limit| stream.packets >= limit) {
            stream.handler.finished(Err(UsbError::Pipe));
            return None;
        }

        stream.handler.fill_out(&mut stream.out_buf);
        let n = stream.out_buf.len().min(stream.in_buf.len());
        stream.in_buf[..n].copy_from_slice(&stream.out_buf[..n]);
        stream.packets += 1;
        self.inner.packets.fetch_add(1, Ordering::Relaxed);

        match stream.handler.handle_in(&stream.in_buf) {
            StreamStatus::Continue => Some(stream),
            StreamStatus::Done => {
                stream.handler.finished(Ok(()));
                None
            }
        }
    }
}

impl UsbBackend for SimulatedBus {
    fn init(&self) -> Result<(), UsbError> {
        if self.inner.fail_init.load(Ordering::Relaxed) {
            return Err(UsbError::NoMem);
        }
        self.inner.initialized.store(true, Ordering::Release);
        debug!("simulated usb context initialized");
        Ok(())
    }

    fn exit(&self) {
        let abandoned = std::mem::take(&mut *self.inner.streams.lock());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "dropping streams at context exit");
        }
        self.inner.hotplug.lock().take();
        self.inner.initialized.store(false, Ordering::Release);
    }

    fn device_list(&self) -> Result<Vec<UsbDeviceRef>, UsbError> {
        if !self.is_initialized() {
            return Err(UsbError::Io);
        }
        if self.inner.fail_enumeration.load(Ordering::Relaxed) {
            return Err(UsbError::NoMem);
        }

        let slots = self.inner.slots.lock();
        Ok(slots
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.is_some())
            .map(|(slot, _)| Self::slot_ref(slot))
            .collect())
    }

    fn descriptor(&self, device: UsbDeviceRef) -> Result<DeviceDescriptor, UsbError> {
        let (_, spec) = self.lookup(device)?;
        Ok(DeviceDescriptor { id: spec.id, serial_index: 3 })
    }

    fn open(&self, device: UsbDeviceRef) -> Result<Box<dyn UsbHandle>, UsbError> {
        let (slot, spec) = self.lookup(device)?;
        if spec.fail_open {
            return Err(UsbError::Access);
        }

        Ok(Box::new(SimulatedHandle {
            bus: self.clone(),
            slot,
            claimed: HashSet::new(),
            streams: Vec::new(),
        }))
    }

    fn set_hotplug_handler(&self, handler: Option<HotplugHandler>) -> Result<(), UsbError> {
        *self.inner.hotplug.lock() = handler;
        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        self.inner.event_rounds.fetch_add(1, Ordering::Relaxed);

        // Handlers may submit or cancel streams, so none are serviced under the lock.
        let pending = std::mem::take(&mut *self.inner.streams.lock());
        let before = self.inner.packets.load(Ordering::Relaxed);
        let had_work = !pending.is_empty();

        let mut kept: Vec<ActiveStream> = pending.into_iter().filter_map(|s| self.service(s)).collect();

        {
            let mut streams = self.inner.streams.lock();
            kept.append(&mut streams);
            *streams = kept;
        }

        let progressed = self.inner.packets.load(Ordering::Relaxed) != before;
        if !progressed && !timeout.is_zero() {
            trace!(had_work, "no stream progress, waiting");
            std::thread::sleep(timeout);
        }
        Ok(())
    }
}

/// Open handle on the simulated bus
pub struct SimulatedHandle {
    bus: SimulatedBus,
    slot: usize,
    claimed: HashSet<u8>,
    streams: Vec<Arc<AtomicBool>>,
}

impl SimulatedHandle {
    fn spec(&self) -> Result<SimulatedDeviceSpec, UsbError> {
        self.bus.inner.spec(self.slot).ok_or(UsbError::NoDevice)
    }
}

impl UsbHandle for SimulatedHandle {
    fn serial_number(&mut self) -> Result<String, UsbError> {
        Ok(self.spec()?.serial)
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let spec = self.spec()?;
        let device_to_host = request_type & 0x80 != 0;

        if !device_to_host {
            return Ok(0);
        }

        let reply = match (request, index) {
            (REQ_GET_VERSION, 0) => spec.hw_version.into_bytes(),
            (REQ_GET_VERSION, 1) => spec.fw_version.into_bytes(),
            _ => Vec::new(),
        };
        let n = reply.len().min(data.len());
        data[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.spec()?;
        if !self.claimed.insert(interface) {
            return Err(UsbError::Busy);
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        if !self.claimed.remove(&interface) {
            return Err(UsbError::NotFound);
        }
        Ok(())
    }

    fn submit_stream(&mut self, config: StreamConfig, handler: Box<dyn StreamHandler>) -> Result<(), UsbError> {
        self.spec()?;
        if config.out_packet_size == 0 || config.in_packet_size == 0 {
            return Err(UsbError::InvalidParam);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        self.streams.retain(|flag| !flag.load(Ordering::Relaxed));
        self.streams.push(cancel.clone());

        self.bus.inner.streams.lock().push(ActiveStream {
            slot: self.slot,
            handler,
            out_buf: vec![0; config.out_packet_size],
            in_buf: vec![0; config.in_packet_size],
            cancel,
            packets: 0,
        });
        Ok(())
    }

    fn cancel_streams(&mut self) -> Result<(), UsbError> {
        for flag in self.streams.drain(..) {
            flag.store(true, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        let _ = self.cancel_streams();
    }
}
