use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Failures of the radio layer (adapter, peripheral, GATT).
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    AdapterUnavailable,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No peripheral with address {address} has been discovered")]
    UnknownPeripheral { address: String },

    #[error("The radio link has already been closed")]
    NotLinked,
}

/// Failures returned synchronously by session operations. Connectivity problems
/// are reported as events instead, see `DeviceEvent::NotConnected`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("The radio is unavailable: {source}")]
    RadioUnavailable { source: DeviceError },

    #[error("Not connected to a device")]
    NotConnected,

    #[error("The session has been closed")]
    Closed,

    #[error("The session service is no longer running")]
    ServiceStopped,
}

impl SessionError {
    pub fn is_radio_unavailable(&self) -> bool {
        matches!(self, SessionError::RadioUnavailable { .. })
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (session): {source}")]
    SessionError { #[from] source: SessionError },

    #[error("Failed to initialize logging: {source}")]
    Logging { #[from] source: fern::InitError },
}
