// src/session/registry.rs
//! Device records keyed by USB identity
//!
//! One record per probed physical device, tagged with whether it is merely
//! available or part of the active set. A device is never in both states.

use crate::hal::{Device, UsbDeviceRef};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Available,
    Active,
}

struct DeviceRecord {
    device: Arc<dyn Device>,
    state: DeviceState,
}

#[derive(Default)]
pub(crate) struct Registry {
    records: BTreeMap<UsbDeviceRef, DeviceRecord>,
}

impl Registry {
    pub(crate) fn find_existing(&self, usb_device: UsbDeviceRef) -> Option<Arc<dyn Device>> {
        self.records.get(&usb_device).map(|r| r.device.clone())
    }

    pub(crate) fn state(&self, usb_device: UsbDeviceRef) -> Option<DeviceState> {
        self.records.get(&usb_device).map(|r| r.state)
    }

    pub(crate) fn insert_available(&mut self, device: Arc<dyn Device>) {
        self.records.insert(
            device.usb_device(),
            DeviceRecord { device, state: DeviceState::Available },
        );
    }

    /// Drop available records whose device is no longer present. Active
    /// devices stay until removed explicitly.
    pub(crate) fn retain_present(&mut self, present: &HashSet<UsbDeviceRef>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|usb, record| record.state == DeviceState::Active || present.contains(usb));
        before - self.records.len()
    }

    pub(crate) fn forget(&mut self, usb_device: UsbDeviceRef) -> Option<Arc<dyn Device>> {
        self.records.remove(&usb_device).map(|r| r.device)
    }

    pub(crate) fn set_state(&mut self, usb_device: UsbDeviceRef, state: DeviceState) {
        if let Some(record) = self.records.get_mut(&usb_device) {
            record.state = state;
        }
    }

    fn in_state(&self, state: DeviceState) -> Vec<Arc<dyn Device>> {
        self.records
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.device.clone())
            .collect()
    }

    pub(crate) fn available(&self) -> Vec<Arc<dyn Device>> {
        self.in_state(DeviceState::Available)
    }

    pub(crate) fn active(&self) -> Vec<Arc<dyn Device>> {
        self.in_state(DeviceState::Active)
    }

    pub(crate) fn active_by_serial(&self, serial: &str) -> Option<Arc<dyn Device>> {
        self.records
            .values()
            .find(|r| r.state == DeviceState::Active && r.device.serial() == serial)
            .map(|r| r.device.clone())
    }

    pub(crate) fn take_all(&mut self) -> Vec<(Arc<dyn Device>, DeviceState)> {
        std::mem::take(&mut self.records)
            .into_values()
            .map(|r| (r.device, r.state))
            .collect()
    }
}
