use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    make_rfduino_receive_uuid, make_rfduino_service_uuid, CONNECT_DELAY, DEVICE_NAME, POLL_DELAY, SCAN_PERIOD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanMode {
    Live,
    Simulated,
}

impl ScanMode {
    pub fn is_simulated(&self) -> bool {
        *self == ScanMode::Simulated
    }
}

impl Default for ScanMode {
    fn default() -> Self {
        ScanMode::Simulated
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ScanMode::Live => "Live",
            ScanMode::Simulated => "Simulated",
        };

        write!(f, "{}", result)
    }
}

/// Everything about the device that is configuration rather than logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub device_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub scan_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

/// Longest delay taken from the config file, so deadlines built from it can not overflow.
pub const MAX_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

fn delay(ms: u64) -> Duration {
    Duration::from_millis(ms.min(MAX_DELAY_MS))
}

impl DeviceConfig {
    pub fn scan_timeout(&self) -> Duration {
        delay(self.scan_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        delay(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        delay(self.reconnect_delay_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_name: DEVICE_NAME.to_string(),
            service_uuid: make_rfduino_service_uuid(),
            characteristic_uuid: make_rfduino_receive_uuid(),
            scan_timeout_ms: SCAN_PERIOD,
            poll_interval_ms: POLL_DELAY,
            reconnect_delay_ms: CONNECT_DELAY,
        }
    }
}

/// The values that survive a restart of the application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastKnown {
    pub distance_mm: u64,
    /// Milliseconds since the unix epoch, 0 if never updated.
    pub updated_at_ms: u64,
    pub scan_mode: ScanMode,
    pub device_label: Option<String>,
}

impl LastKnown {
    pub fn updated_at(&self) -> Option<SystemTime> {
        match self.updated_at_ms {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device: DeviceConfig,
    pub last: LastKnown,
}
