// src/config/constants.rs
//! System-wide configuration constants

/// Sampling constants
pub mod sampling {
    pub const DEFAULT_SAMPLE_RATE_HZ: u64 = 100_000;
    pub const MIN_SAMPLE_RATE_HZ: u64 = 1_000;
    pub const MAX_SAMPLE_RATE_HZ: u64 = 100_000;
}

/// Background I/O thread timing
pub mod timing {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
    pub const MIN_POLL_INTERVAL_MS: u64 = 1;
    pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;

    /// `None`: `Session::end` waits until every device completes.
    pub const DEFAULT_COMPLETION_TIMEOUT_MS: Option<u64> = None;
}

/// Notification queue between the I/O thread and user callbacks
pub mod events {
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
    pub const MIN_EVENT_QUEUE_CAPACITY: usize = 16;
}

/// USB identifiers
pub mod usb {
    /// Vendor/product pairs accepted by the built-in device family.
    pub const SUPPORTED_DEVICES: &[(u16, u16)] = &[(0x0456, 0xcee2), (0x064b, 0x784c)];

    /// Timeout for control transfers issued during init/configure.
    pub const CONTROL_TIMEOUT_MS: u64 = 100;
}

/// Configuration file search paths and environment overrides
pub mod paths {
    pub const CONFIG_FILE_NAME: &str = "smu.toml";
    pub const SYSTEM_CONFIG_DIR: &str = "/etc/smu";
    pub const ENV_CONFIG_PATH: &str = "SMU_CONFIG";
    pub const ENV_SAMPLE_RATE_HZ: &str = "SMU_SAMPLE_RATE_HZ";
    pub const ENV_POLL_INTERVAL_MS: &str = "SMU_POLL_INTERVAL_MS";
}
