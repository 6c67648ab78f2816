use std::fmt;
use std::time::SystemTime;

use crate::device::protocol::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// True while a scan, a connection attempt or a connection is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning | ConnectionState::Connecting | ConnectionState::Discovering | ConnectionState::Connected
        )
    }
}

/// A live session learns the address of its device while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Live { address: Option<DeviceAddress> },
    Simulated,
}

impl SessionKind {
    pub fn from_simulated(simulated: bool) -> Self {
        if simulated { SessionKind::Simulated } else { SessionKind::Live { address: None } }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, SessionKind::Simulated)
    }
}

/// Opaque identifier of a peripheral as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub String);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotConnectedReason {
    /// `poll` was called without an established link
    NoLink,
    ScanTimeout,
    ScanFailed,
    LinkFailed,
    ServicesMissing,
    LinkDropped,
    Stopped,
}

/// Events raised by a session for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Scanning,
    Connected { label: String },
    NotConnected { reason: NotConnectedReason },
    ValueAvailable { reading: Reading, received_at: SystemTime },
}

/// Outcomes reported by the radio, one per callback of the underlying stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    DeviceFound { name: Option<String>, address: DeviceAddress },
    ScanFailed { reason: String },
    LinkEstablished,
    LinkFailed { reason: String },
    ServicesDiscovered { success: bool },
    LinkDropped,
    ValueRead(Vec<u8>),
}
