// src/hal/types.rs
//! Read-only device, channel and signal descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

/// SI base-unit exponents (m, kg, s, A, K, mol, cd)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub m: i8,
    pub kg: i8,
    pub s: i8,
    pub a: i8,
    pub k: i8,
    pub mol: i8,
    pub cd: i8,
}

impl Unit {
    pub const VOLT: Unit = Unit { m: 2, kg: 1, s: -3, a: -1, k: 0, mol: 0, cd: 0 };
    pub const AMPERE: Unit = Unit { m: 0, kg: 0, s: 0, a: 1, k: 0, mol: 0, cd: 0 };
}

/// Operating mode of a source-measure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Output disabled, both signals measured
    #[default]
    HighZ,
    /// Source voltage, measure current
    Svmi,
    /// Source current, measure voltage
    Simv,
}

impl ChannelMode {
    /// Bit used in [`SignalInfo`] mode masks
    pub const fn mask(self) -> u32 {
        match self {
            ChannelMode::HighZ => 1 << 0,
            ChannelMode::Svmi => 1 << 1,
            ChannelMode::Simv => 1 << 2,
        }
    }
}

/// Static description of one signal on a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalInfo {
    pub label: &'static str,
    /// Bitmask of modes in which this signal is measured
    pub input_modes: u32,
    /// Bitmask of modes in which this signal is sourced
    pub output_modes: u32,
    pub unit: Unit,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

impl SignalInfo {
    pub fn is_output_in(&self, mode: ChannelMode) -> bool {
        self.output_modes & mode.mask() != 0
    }

    pub fn is_input_in(&self, mode: ChannelMode) -> bool {
        self.input_modes & mode.mask() != 0
    }

    /// Clamp a value into the signal's physical range
    pub fn clamp(&self, value: f32) -> f32 {
        (value as f64).clamp(self.min, self.max) as f32
    }
}

/// Static description of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub label: &'static str,
    pub mode_count: usize,
    pub signal_count: usize,
}

/// Information read from a device after a successful `init()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub label: String,
    pub channel_count: usize,
    pub serial: String,
    pub hw_version: String,
    pub fw_version: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (hw {}, fw {})",
            self.label, self.serial, self.hw_version, self.fw_version
        )
    }
}
