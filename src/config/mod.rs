// src/config/mod.rs
//! Session configuration

pub mod constants;
pub mod loader;

pub use loader::ConfigLoader;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Vendor/product identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "defaults::sample_rate_hz")]
    pub sample_rate_hz: u64,

    /// Upper bound on one background-loop wait; `cancel()` takes effect within it.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long `Session::end` waits for devices; `None` waits forever.
    #[serde(default = "defaults::completion_timeout_ms")]
    pub completion_timeout_ms: Option<u64>,

    #[serde(default = "defaults::event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "defaults::supported_devices")]
    pub supported_devices: Vec<UsbId>,
}

/// Default value providers using constants
mod defaults {
    use super::UsbId;
    use crate::config::constants::*;

    pub fn sample_rate_hz() -> u64 { sampling::DEFAULT_SAMPLE_RATE_HZ }
    pub fn poll_interval_ms() -> u64 { timing::DEFAULT_POLL_INTERVAL_MS }
    pub fn completion_timeout_ms() -> Option<u64> { timing::DEFAULT_COMPLETION_TIMEOUT_MS }
    pub fn event_queue_capacity() -> usize { events::DEFAULT_EVENT_QUEUE_CAPACITY }
    pub fn supported_devices() -> Vec<UsbId> {
        usb::SUPPORTED_DEVICES
            .iter()
            .map(|&(vendor_id, product_id)| UsbId::new(vendor_id, product_id))
            .collect()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: defaults::sample_rate_hz(),
            poll_interval_ms: defaults::poll_interval_ms(),
            completion_timeout_ms: defaults::completion_timeout_ms(),
            event_queue_capacity: defaults::event_queue_capacity(),
            supported_devices: defaults::supported_devices(),
        }
    }
}

impl SessionConfig {
    /// Validate ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        use constants::*;

        if self.sample_rate_hz < sampling::MIN_SAMPLE_RATE_HZ
            || self.sample_rate_hz > sampling::MAX_SAMPLE_RATE_HZ
        {
            return Err(ConfigError::Invalid {
                field: "sample_rate_hz",
                reason: format!(
                    "{} not in {}..={}",
                    self.sample_rate_hz,
                    sampling::MIN_SAMPLE_RATE_HZ,
                    sampling::MAX_SAMPLE_RATE_HZ
                ),
            });
        }

        if self.poll_interval_ms < timing::MIN_POLL_INTERVAL_MS
            || self.poll_interval_ms > timing::MAX_POLL_INTERVAL_MS
        {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: format!(
                    "{} not in {}..={}",
                    self.poll_interval_ms,
                    timing::MIN_POLL_INTERVAL_MS,
                    timing::MAX_POLL_INTERVAL_MS
                ),
            });
        }

        if self.completion_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "completion_timeout_ms",
                reason: "must be greater than 0 when set".to_string(),
            });
        }

        if self.event_queue_capacity < events::MIN_EVENT_QUEUE_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "event_queue_capacity",
                reason: format!("must be at least {}", events::MIN_EVENT_QUEUE_CAPACITY),
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_supported(&self, id: UsbId) -> bool {
        self.supported_devices.contains(&id)
    }
}
