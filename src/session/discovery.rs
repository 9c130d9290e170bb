// src/session/discovery.rs
//! Device probing shared by explicit rescans and hotplug notices

use crate::error::{SmuError, SmuResult};
use crate::hal::{Device, DeviceDriver, HotplugEvent, UsbBackend, UsbDeviceRef};
use crate::session::events::EventSender;
use crate::session::registry::{DeviceState, Registry};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct Discovery {
    backend: Arc<dyn UsbBackend>,
    drivers: Mutex<Vec<Arc<dyn DeviceDriver>>>,
    registry: Mutex<Registry>,
}

impl Discovery {
    pub(crate) fn new(backend: Arc<dyn UsbBackend>, drivers: Vec<Arc<dyn DeviceDriver>>) -> Self {
        Self {
            backend,
            drivers: Mutex::new(drivers),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    pub(crate) fn register_driver(&self, driver: Arc<dyn DeviceDriver>) {
        self.drivers.lock().push(driver);
    }

    /// Enumerate the bus, probe new devices and forget vanished ones.
    pub(crate) fn rescan(&self) -> SmuResult<usize> {
        let list = self.backend.device_list().map_err(|e| {
            warn!(error = %e, "device enumeration failed");
            SmuError::Backend(e)
        })?;

        let mut registry = self.registry.lock();
        let mut present = HashSet::new();

        for usb_device in list {
            if registry.find_existing(usb_device).is_some() {
                present.insert(usb_device);
                continue;
            }
            if let Some(device) = self.probe(usb_device) {
                info!(device = %usb_device, info = %device.info(), "device discovered");
                registry.insert_available(device);
                present.insert(usb_device);
            }
        }

        let gone = registry.retain_present(&present);
        if gone > 0 {
            debug!(count = gone, "forgot disconnected devices");
        }

        Ok(present.len())
    }

    /// Probe a newly arrived device. Returns it if it joined the available set.
    pub(crate) fn attached(&self, usb_device: UsbDeviceRef) -> Option<Arc<dyn Device>> {
        let mut registry = self.registry.lock();
        if registry.find_existing(usb_device).is_some() {
            return None;
        }
        let device = self.probe(usb_device)?;
        info!(device = %usb_device, info = %device.info(), "device attached");
        registry.insert_available(device.clone());
        Some(device)
    }

    /// Forget a departed available device. Active devices stay until removed.
    pub(crate) fn detached(&self, usb_device: UsbDeviceRef) -> Option<Arc<dyn Device>> {
        let mut registry = self.registry.lock();
        let device = registry.find_existing(usb_device)?;
        if registry.state(usb_device) == Some(DeviceState::Available) {
            registry.forget(usb_device);
        }
        info!(device = %usb_device, serial = %device.serial(), "device detached");
        Some(device)
    }

    /// Identify and open a device. Unsupported or unopenable devices are skipped.
    fn probe(&self, usb_device: UsbDeviceRef) -> Option<Arc<dyn Device>> {
        let descriptor = match self.backend.descriptor(usb_device) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(device = %usb_device, error = %e, "descriptor read failed");
                return None;
            }
        };

        let driver = self.drivers.lock().iter().find(|d| d.matches(&descriptor)).cloned()?;

        let mut device = driver.create(usb_device, &descriptor);
        if let Err(e) = device.init(self.backend.as_ref()) {
            warn!(device = %usb_device, driver = driver.name(), error = %e, "device init failed");
            return None;
        }
        Some(Arc::from(device))
    }
}

/// Route backend hotplug notices through `discovery` to the notifier thread.
pub(crate) fn hotplug_handler(
    discovery: &Arc<Discovery>,
    events: EventSender,
) -> impl Fn(UsbDeviceRef, HotplugEvent) + Send + Sync + 'static {
    let discovery = Arc::downgrade(discovery);
    move |usb_device, event| {
        let Some(discovery) = discovery.upgrade() else {
            return;
        };
        match event {
            HotplugEvent::Arrived => {
                if let Some(device) = discovery.attached(usb_device) {
                    events.device_attached(device);
                }
            }
            HotplugEvent::Left => {
                if let Some(device) = discovery.detached(usb_device) {
                    events.device_detached(device);
                }
            }
        }
    }
}
