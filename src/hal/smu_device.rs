// src/hal/smu_device.rs
//! Two-channel source-measure unit
//!
//! Each channel (A, B) has a Voltage and a Current signal. In SVMI mode the
//! channel sources voltage and measures current, in SIMV the reverse, and in
//! HighZ it sources nothing and measures both.
//!
//! Stream packets carry 16 ticks; each tick is four little-endian `f32`
//! values in the order A.voltage, A.current, B.voltage, B.current.

use crate::config::constants::{sampling, usb};
use crate::config::UsbId;
use crate::error::{DeviceError, UsbError};
use crate::hal::traits::{Device, DeviceDriver};
use crate::hal::types::{ChannelInfo, ChannelMode, DeviceInfo, SignalInfo, Unit};
use crate::hal::usb::{
    DeviceDescriptor, StreamConfig, StreamHandler, StreamStatus, UsbBackend, UsbDeviceRef, UsbHandle,
};
use crate::session::RunContext;
use crate::signal::Signal;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CHANNEL_COUNT: usize = 2;
pub const SIGNALS_PER_CHANNEL: usize = 2;

pub const SIGNAL_VOLTAGE: usize = 0;
pub const SIGNAL_CURRENT: usize = 1;

pub const TICKS_PER_PACKET: usize = 16;
const VALUES_PER_TICK: usize = CHANNEL_COUNT * SIGNALS_PER_CHANNEL;
const TICK_BYTES: usize = VALUES_PER_TICK * 4;
pub const PACKET_BYTES: usize = TICKS_PER_PACKET * TICK_BYTES;

/// Timer clock the sample-rate divider is derived from
pub const TIMER_CLOCK_HZ: u64 = 48_000_000;

const STREAM_INTERFACE: u8 = 0;

const REQ_TYPE_IN: u8 = 0xC0;
const REQ_TYPE_OUT: u8 = 0x40;
const REQ_GET_VERSION: u8 = 0x00;
const REQ_SET_MODE: u8 = 0x53;
const REQ_SET_POWER: u8 = 0x59;
const REQ_SET_DIVIDER: u8 = 0xC5;

static VOLTAGE: SignalInfo = SignalInfo {
    label: "Voltage",
    input_modes: 0x7,
    output_modes: 0x2,
    unit: Unit::VOLT,
    min: 0.0,
    max: 5.0,
    resolution: 5.0 / 65536.0,
};

static CURRENT: SignalInfo = SignalInfo {
    label: "Current",
    input_modes: 0x6,
    output_modes: 0x4,
    unit: Unit::AMPERE,
    min: -0.2,
    max: 0.2,
    resolution: 0.4 / 65536.0,
};

static CHANNELS: [ChannelInfo; CHANNEL_COUNT] = [
    ChannelInfo { label: "A", mode_count: 3, signal_count: SIGNALS_PER_CHANNEL },
    ChannelInfo { label: "B", mode_count: 3, signal_count: SIGNALS_PER_CHANNEL },
];

/// Analog frontend state shared between caller and I/O thread
struct Frontend {
    signals: [[Signal; SIGNALS_PER_CHANNEL]; CHANNEL_COUNT],
    modes: [ChannelMode; CHANNEL_COUNT],
}

impl Frontend {
    fn new() -> Self {
        let channel = || [Signal::new(&VOLTAGE), Signal::new(&CURRENT)];
        Self {
            signals: [channel(), channel()],
            modes: [ChannelMode::HighZ; CHANNEL_COUNT],
        }
    }
}

/// SMU device instance
pub struct SmuDevice {
    usb_device: UsbDeviceRef,
    descriptor: DeviceDescriptor,
    supported: Vec<UsbId>,
    info: DeviceInfo,
    handle: Mutex<Option<Box<dyn UsbHandle>>>,
    frontend: Arc<Mutex<Frontend>>,
    sample_rate: AtomicU64,
    powered: AtomicBool,
    running: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
}

impl SmuDevice {
    pub fn new(usb_device: UsbDeviceRef, descriptor: DeviceDescriptor, supported: Vec<UsbId>) -> Self {
        Self {
            usb_device,
            descriptor,
            supported,
            info: DeviceInfo {
                label: "SMU".to_string(),
                channel_count: CHANNEL_COUNT,
                serial: String::new(),
                hw_version: String::new(),
                fw_version: String::new(),
            },
            handle: Mutex::new(None),
            frontend: Arc::new(Mutex::new(Frontend::new())),
            sample_rate: AtomicU64::new(sampling::DEFAULT_SAMPLE_RATE_HZ),
            powered: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Rate applied by the last successful `configure`
    pub fn sample_rate(&self) -> u64 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn mode(&self, channel: usize) -> Option<ChannelMode> {
        self.frontend.lock().modes.get(channel).copied()
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    fn with_handle<T>(&self, f: impl FnOnce(&mut dyn UsbHandle) -> Result<T, UsbError>) -> Result<T, DeviceError> {
        let mut guard = self.handle.lock();
        let handle = guard.as_deref_mut().ok_or(DeviceError::NotOpen)?;
        f(handle).map_err(DeviceError::Transfer)
    }

    fn control_out(&self, request: u8, value: u16, index: u16) -> Result<(), DeviceError> {
        self.with_handle(|h| {
            h.control_transfer(REQ_TYPE_OUT, request, value, index, &mut [], control_timeout())
                .map(|_| ())
        })
    }

    fn read_version(handle: &mut dyn UsbHandle, index: u16) -> Result<String, UsbError> {
        let mut buf = [0u8; 64];
        let n = handle.control_transfer(REQ_TYPE_IN, REQ_GET_VERSION, 0, index, &mut buf, control_timeout())?;
        Ok(String::from_utf8_lossy(&buf[..n]).trim_end_matches('\0').to_string())
    }
}

fn control_timeout() -> Duration {
    Duration::from_millis(usb::CONTROL_TIMEOUT_MS)
}

/// Sample-rate divider and the rate it actually produces
fn rate_divider(requested: u64) -> (u16, u64) {
    let divider = (TIMER_CLOCK_HZ / requested).clamp(1, u16::MAX as u64);
    (divider as u16, TIMER_CLOCK_HZ / divider)
}

impl Device for SmuDevice {
    fn usb_device(&self) -> UsbDeviceRef {
        self.usb_device
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn channel_info(&self, channel: usize) -> Option<&ChannelInfo> {
        CHANNELS.get(channel)
    }

    fn signal(&self, channel: usize, signal: usize) -> Option<MappedMutexGuard<'_, Signal>> {
        if channel >= CHANNEL_COUNT || signal >= SIGNALS_PER_CHANNEL {
            return None;
        }
        Some(MutexGuard::map(self.frontend.lock(), |fe| &mut fe.signals[channel][signal]))
    }

    fn set_mode(&self, channel: usize, mode: ChannelMode) -> Result<(), DeviceError> {
        if channel >= CHANNEL_COUNT {
            return Err(DeviceError::InvalidChannel(channel));
        }
        if self.running.load(Ordering::Acquire) {
            return Err(DeviceError::Busy);
        }

        self.control_out(REQ_SET_MODE, mode.mask() as u16, channel as u16)?;
        self.frontend.lock().modes[channel] = mode;
        debug!(serial = %self.info.serial, channel, ?mode, "channel mode set");
        Ok(())
    }

    fn init(&mut self, backend: &dyn UsbBackend) -> Result<(), DeviceError> {
        let descriptor = backend.descriptor(self.usb_device).map_err(DeviceError::Open)?;
        if descriptor.id != self.descriptor.id || !self.supported.contains(&descriptor.id) {
            return Err(DeviceError::Identity {
                vendor_id: descriptor.id.vendor_id,
                product_id: descriptor.id.product_id,
            });
        }

        let mut handle = backend.open(self.usb_device).map_err(DeviceError::Open)?;
        self.info.serial = handle.serial_number().map_err(DeviceError::Open)?;
        self.info.hw_version = Self::read_version(handle.as_mut(), 0).map_err(DeviceError::Open)?;
        self.info.fw_version = Self::read_version(handle.as_mut(), 1).map_err(DeviceError::Open)?;
        *self.handle.get_mut() = Some(handle);

        debug!(device = %self.usb_device, info = %self.info, "device initialized");
        Ok(())
    }

    fn added(&self) -> Result<(), DeviceError> {
        self.with_handle(|h| h.claim_interface(STREAM_INTERFACE))
    }

    fn removed(&self) -> Result<(), DeviceError> {
        self.with_handle(|h| h.release_interface(STREAM_INTERFACE))
    }

    fn configure(&self, sample_rate: u64) -> Result<u64, DeviceError> {
        if !(sampling::MIN_SAMPLE_RATE_HZ..=sampling::MAX_SAMPLE_RATE_HZ).contains(&sample_rate) {
            return Err(DeviceError::UnsupportedRate {
                requested: sample_rate,
                min: sampling::MIN_SAMPLE_RATE_HZ,
                max: sampling::MAX_SAMPLE_RATE_HZ,
            });
        }
        if self.running.load(Ordering::Acquire) {
            return Err(DeviceError::Busy);
        }

        let (divider, actual) = rate_divider(sample_rate);
        self.control_out(REQ_SET_DIVIDER, divider, 0)?;
        self.sample_rate.store(actual, Ordering::Relaxed);
        debug!(serial = %self.info.serial, requested = sample_rate, actual, "sample rate configured");
        Ok(actual)
    }

    fn on(&self) -> Result<(), DeviceError> {
        self.control_out(REQ_SET_POWER, 1, 0)?;
        self.powered.store(true, Ordering::Release);
        Ok(())
    }

    fn off(&self) -> Result<(), DeviceError> {
        self.control_out(REQ_SET_POWER, 0, 0)?;
        self.powered.store(false, Ordering::Release);
        Ok(())
    }

    fn start_run(&self, nsamples: u64, ctx: RunContext) -> Result<(), DeviceError> {
        if !self.is_powered() {
            return Err(DeviceError::NotPowered);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::Busy);
        }
        self.cancel_requested.store(false, Ordering::Release);

        let stream = RunStream {
            frontend: self.frontend.clone(),
            ctx,
            nsamples,
            sent: 0,
            received: 0,
            cancel_requested: self.cancel_requested.clone(),
            running: self.running.clone(),
        };
        let config = StreamConfig { out_packet_size: PACKET_BYTES, in_packet_size: PACKET_BYTES };

        let submitted = self.with_handle(|h| h.submit_stream(config, Box::new(stream)));
        if submitted.is_err() {
            self.running.store(false, Ordering::Release);
        }
        submitted?;

        info!(serial = %self.info.serial, nsamples, rate = self.sample_rate(), "stream started");
        Ok(())
    }

    fn cancel(&self) -> Result<(), DeviceError> {
        self.cancel_requested.store(true, Ordering::Release);
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        debug!(serial = %self.info.serial, "cancelling stream");
        self.with_handle(|h| h.cancel_streams())
    }
}

impl Drop for SmuDevice {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.get_mut().take() {
            if let Err(e) = handle.cancel_streams() {
                warn!(device = %self.usb_device, error = %e, "failed to cancel streams on drop");
            }
        }
    }
}

/// Stream state for one run, owned by the backend while the run lasts
struct RunStream {
    frontend: Arc<Mutex<Frontend>>,
    ctx: RunContext,
    nsamples: u64,
    sent: u64,
    received: u64,
    cancel_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl RunStream {
    fn wants(&self, count: u64) -> bool {
        self.nsamples == 0 || count < self.nsamples
    }

    fn aborted(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire) || self.ctx.is_cancelled()
    }
}

impl StreamHandler for RunStream {
    fn fill_out(&mut self, packet: &mut [u8]) {
        let mut frontend = self.frontend.lock();
        let Frontend { signals, modes } = &mut *frontend;

        for tick in packet.chunks_exact_mut(TICK_BYTES) {
            if !self.wants(self.sent) {
                tick.fill(0);
                continue;
            }
            for (ch, channel) in signals.iter_mut().enumerate() {
                for (idx, signal) in channel.iter_mut().enumerate() {
                    let value = if signal.info().is_output_in(modes[ch]) {
                        signal.info().clamp(signal.get_sample())
                    } else {
                        0.0
                    };
                    let offset = (ch * SIGNALS_PER_CHANNEL + idx) * 4;
                    tick[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
            self.sent += 1;
        }
    }

    fn handle_in(&mut self, packet: &[u8]) -> StreamStatus {
        if self.aborted() {
            return StreamStatus::Done;
        }

        {
            let mut frontend = self.frontend.lock();
            let Frontend { signals, modes } = &mut *frontend;

            for tick in packet.chunks_exact(TICK_BYTES) {
                if !self.wants(self.received) {
                    break;
                }
                for (ch, channel) in signals.iter_mut().enumerate() {
                    for (idx, signal) in channel.iter_mut().enumerate() {
                        if !signal.info().is_input_in(modes[ch]) {
                            continue;
                        }
                        let offset = (ch * SIGNALS_PER_CHANNEL + idx) * 4;
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&tick[offset..offset + 4]);
                        signal.put_sample(f32::from_le_bytes(raw));
                    }
                }
                self.received += 1;
            }
        }

        self.ctx.report_progress(self.received);
        if self.wants(self.received) { StreamStatus::Continue } else { StreamStatus::Done }
    }

    fn finished(&mut self, status: Result<(), UsbError>) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = status {
            if !e.is_cancellation() {
                self.ctx.report_error(e);
            }
        }
        self.ctx.complete();
    }
}

/// Driver for the SMU family
pub struct SmuDriver {
    supported: Vec<UsbId>,
}

impl SmuDriver {
    pub fn new(supported: Vec<UsbId>) -> Self {
        Self { supported }
    }
}

impl Default for SmuDriver {
    fn default() -> Self {
        Self::new(
            usb::SUPPORTED_DEVICES
                .iter()
                .map(|&(vendor_id, product_id)| UsbId::new(vendor_id, product_id))
                .collect(),
        )
    }
}

impl DeviceDriver for SmuDriver {
    fn name(&self) -> &str {
        "smu"
    }

    fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.supported.contains(&descriptor.id)
    }

    fn create(&self, usb_device: UsbDeviceRef, descriptor: &DeviceDescriptor) -> Box<dyn Device> {
        Box::new(SmuDevice::new(usb_device, *descriptor, self.supported.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::simulator::{SimulatedBus, SimulatedDeviceSpec};

    const ID: UsbId = UsbId::new(0x0456, 0xcee2);

    fn open_device(bus: &SimulatedBus) -> SmuDevice {
        bus.init().unwrap();
        let usb_device = bus.device_list().unwrap()[0];
        let descriptor = bus.descriptor(usb_device).unwrap();
        let mut dev = SmuDevice::new(usb_device, descriptor, vec![ID]);
        dev.init(bus).unwrap();
        dev
    }

    #[test]
    fn test_init_reads_identity() {
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(ID, "SER001")]);
        let dev = open_device(&bus);
        assert_eq!(dev.serial(), "SER001");
        assert_eq!(dev.info().hw_version, "F");
        assert_eq!(dev.info().fw_version, "2.17");
        assert_eq!(dev.channel_info(1).unwrap().label, "B");
        assert!(dev.channel_info(2).is_none());
    }

    #[test]
    fn test_init_rejects_unsupported_id() {
        let other = UsbId::new(0x1234, 0x5678);
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(other, "X")]);
        bus.init().unwrap();
        let usb_device = bus.device_list().unwrap()[0];
        let descriptor = bus.descriptor(usb_device).unwrap();

        let mut dev = SmuDevice::new(usb_device, descriptor, vec![ID]);
        assert_eq!(
            dev.init(&bus),
            Err(DeviceError::Identity { vendor_id: 0x1234, product_id: 0x5678 })
        );
    }

    #[test]
    fn test_init_open_failure() {
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(ID, "X").failing_open()]);
        bus.init().unwrap();
        let usb_device = bus.device_list().unwrap()[0];
        let descriptor = bus.descriptor(usb_device).unwrap();

        let mut dev = SmuDevice::new(usb_device, descriptor, vec![ID]);
        assert_eq!(dev.init(&bus), Err(DeviceError::Open(UsbError::Access)));
    }

    #[test]
    fn test_configure_rate_range_and_divider() {
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(ID, "SER001")]);
        let dev = open_device(&bus);

        assert_eq!(dev.configure(100_000), Ok(100_000));
        assert_eq!(dev.configure(7_000), Ok(7_000));
        assert!(matches!(dev.configure(10), Err(DeviceError::UnsupportedRate { requested: 10, .. })));
        assert_eq!(dev.sample_rate(), 7_000);
    }

    #[test]
    fn test_uninitialized_device_is_not_open() {
        let dev = SmuDevice::new(
            UsbDeviceRef { bus: 1, address: 1 },
            DeviceDescriptor { id: ID, serial_index: 3 },
            vec![ID],
        );
        assert_eq!(dev.on(), Err(DeviceError::NotOpen));
        assert_eq!(dev.added(), Err(DeviceError::NotOpen));
    }

    #[test]
    fn test_set_mode_validates_channel() {
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(ID, "SER001")]);
        let dev = open_device(&bus);

        dev.set_mode(0, ChannelMode::Svmi).unwrap();
        assert_eq!(dev.mode(0), Some(ChannelMode::Svmi));
        assert_eq!(dev.mode(1), Some(ChannelMode::HighZ));
        assert_eq!(dev.set_mode(2, ChannelMode::Simv), Err(DeviceError::InvalidChannel(2)));
    }

    #[test]
    fn test_signal_access_bounds() {
        let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(ID, "SER001")]);
        let dev = open_device(&bus);

        assert_eq!(dev.signal(0, SIGNAL_VOLTAGE).unwrap().info().label, "Voltage");
        assert_eq!(dev.signal(1, SIGNAL_CURRENT).unwrap().info().label, "Current");
        assert!(dev.signal(0, 2).is_none());
        assert!(dev.signal(2, 0).is_none());
    }

    #[test]
    fn test_rate_divider() {
        assert_eq!(rate_divider(100_000), (480, 100_000));
        assert_eq!(rate_divider(30_000), (1600, 30_000));
    }

    #[test]
    fn test_packet_layout() {
        assert_eq!(PACKET_BYTES, 256);
        assert_eq!(TICK_BYTES, 16);
    }
}
