//! A session is one attempt to scan for, connect to and read from the device.
//!
//! Sessions never talk to the consumer directly. Every operation appends the events it raises to
//! the `events` vector it is given; the `SessionManager` forwards them.

use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::types::DeviceConfig;
use crate::device::constants::{SIMULATED_DEVICE_LABEL, TAG_DISTANCE};
use crate::device::protocol::{decode, Reading};
use crate::device::radio::{DiscoveryFilter, RadioLink};
use crate::device::types::{ConnectionState, DeviceAddress, DeviceEvent, LinkEvent, NotConnectedReason, SessionKind};
use crate::error::SessionError;

pub trait DeviceSession: Send {
    fn kind(&self) -> SessionKind;

    fn state(&self) -> ConnectionState;

    fn last_seen_at(&self) -> Option<SystemTime>;

    fn start(&mut self, events: &mut Vec<DeviceEvent>) -> Result<(), SessionError>;

    /// Requests one value. `Ok(Some(_))` if the value is available right away, `Ok(None)` if the
    /// request was accepted and the value will arrive as a `ValueAvailable` event.
    fn poll(&mut self, events: &mut Vec<DeviceEvent>) -> Result<Option<Reading>, SessionError>;

    fn stop(&mut self, events: &mut Vec<DeviceEvent>);

    fn close(&mut self);

    fn handle_link_event(&mut self, _event: LinkEvent, _events: &mut Vec<DeviceEvent>) {}

    /// When `timeout_elapsed` should be called, if at all.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn timeout_elapsed(&mut self, _events: &mut Vec<DeviceEvent>) {}
}

pub struct LiveSession {
    config: DeviceConfig,
    radio: Option<Box<dyn RadioLink>>,
    state: ConnectionState,
    address: Option<DeviceAddress>,
    scan_deadline: Option<Instant>,
    last_seen_at: Option<SystemTime>,
}

impl LiveSession {
    pub fn new(config: DeviceConfig, radio: Box<dyn RadioLink>) -> Self {
        LiveSession {
            config,
            radio: Some(radio),
            state: ConnectionState::Idle,
            address: None,
            scan_deadline: None,
            last_seen_at: None,
        }
    }

    pub fn address(&self) -> Option<&DeviceAddress> {
        self.address.as_ref()
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Live session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // Leaves whatever is in progress and reports the device as not connected.
    fn fail(&mut self, reason: NotConnectedReason, events: &mut Vec<DeviceEvent>) {
        if let Some(radio) = self.radio.as_mut() {
            match self.state {
                ConnectionState::Scanning => radio.stop_discovery(),
                ConnectionState::Connecting | ConnectionState::Discovering | ConnectionState::Connected => radio.disconnect(),
                ConnectionState::Idle | ConnectionState::Disconnected => {},
            }
        }

        self.scan_deadline = None;
        self.transition(ConnectionState::Disconnected);
        events.push(DeviceEvent::NotConnected { reason });
    }

    fn device_found(&mut self, name: Option<String>, address: DeviceAddress, events: &mut Vec<DeviceEvent>) {
        if self.state != ConnectionState::Scanning {
            return;
        }

        if name.as_deref() != Some(self.config.device_name.as_str()) {
            debug!("Ignoring advertisement of {} ({})", address, name.unwrap_or(String::from("NONE")));
            return;
        }

        info!("Found {} at {}", self.config.device_name, address);

        self.scan_deadline = None;
        self.address = Some(address.clone());
        self.transition(ConnectionState::Connecting);

        let Some(radio) = self.radio.as_mut() else { return };
        radio.stop_discovery();
        if let Err(err) = radio.connect(&address) {
            warn!("Connecting to {} failed: {}", address, err);
            self.fail(NotConnectedReason::LinkFailed, events);
        }
    }

    fn link_established(&mut self, events: &mut Vec<DeviceEvent>) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        self.transition(ConnectionState::Discovering);

        let Some(radio) = self.radio.as_mut() else { return };
        if let Err(err) = radio.discover_services() {
            warn!("Service discovery failed: {}", err);
            self.fail(NotConnectedReason::ServicesMissing, events);
        }
    }

    fn services_discovered(&mut self, success: bool, events: &mut Vec<DeviceEvent>) {
        if self.state != ConnectionState::Discovering {
            return;
        }

        if !success {
            warn!("Device does not offer the expected service");
            self.fail(NotConnectedReason::ServicesMissing, events);
            return;
        }

        self.last_seen_at = Some(SystemTime::now());
        self.transition(ConnectionState::Connected);
        events.push(DeviceEvent::Connected { label: self.config.device_name.clone() });
    }

    fn value_read(&mut self, bytes: Vec<u8>, events: &mut Vec<DeviceEvent>) {
        if self.state != ConnectionState::Connected {
            debug!("Ignoring value read while {:?}", self.state);
            return;
        }

        let reading = decode(&bytes);
        if let Reading::Invalid { raw, reason } = &reading {
            warn!("Received invalid payload >>>{}<<< ({})", raw, reason);
        }

        let now = SystemTime::now();
        self.last_seen_at = Some(now);
        events.push(DeviceEvent::ValueAvailable { reading, received_at: now });
    }
}

impl DeviceSession for LiveSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Live { address: self.address.clone() }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn last_seen_at(&self) -> Option<SystemTime> {
        self.last_seen_at
    }

    fn start(&mut self, events: &mut Vec<DeviceEvent>) -> Result<(), SessionError> {
        if self.state.is_active() {
            debug!("Live session already {:?}, not starting another scan", self.state);
            return Ok(());
        }

        let filter = DiscoveryFilter {
            device_name: self.config.device_name.clone(),
            service: self.config.service_uuid,
        };
        if self.radio.is_none() {
            return Err(SessionError::Closed);
        }

        self.address = None;
        self.scan_deadline = Some(Instant::now() + self.config.scan_timeout());
        self.transition(ConnectionState::Scanning);
        events.push(DeviceEvent::Scanning);

        let radio = self.radio.as_mut().ok_or(SessionError::Closed)?;
        if let Err(err) = radio.start_discovery(&filter) {
            warn!("Scanning failed {:?}", err);
            self.fail(NotConnectedReason::ScanFailed, events);
        }

        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<DeviceEvent>) -> Result<Option<Reading>, SessionError> {
        let characteristic = self.config.characteristic_uuid;
        let radio = self.radio.as_mut().ok_or(SessionError::Closed)?;

        if self.state != ConnectionState::Connected {
            debug!("Poll while {:?}", self.state);
            events.push(DeviceEvent::NotConnected { reason: NotConnectedReason::NoLink });
            return Err(SessionError::NotConnected);
        }

        if let Err(err) = radio.read_characteristic(characteristic) {
            warn!("Device lost, read request failed: {}", err);
            self.fail(NotConnectedReason::LinkDropped, events);
            return Err(SessionError::NotConnected);
        }

        Ok(None)
    }

    fn stop(&mut self, events: &mut Vec<DeviceEvent>) {
        if self.state.is_active() {
            self.fail(NotConnectedReason::Stopped, events);
        } else {
            self.scan_deadline = None;
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn close(&mut self) {
        if let Some(mut radio) = self.radio.take() {
            info!("Closing live session (address {:?})", self.address);
            if self.state == ConnectionState::Scanning {
                radio.stop_discovery();
            }
            radio.close();
        }

        self.scan_deadline = None;
        self.transition(ConnectionState::Disconnected);
    }

    fn handle_link_event(&mut self, event: LinkEvent, events: &mut Vec<DeviceEvent>) {
        if self.radio.is_none() {
            return;
        }

        match event {
            LinkEvent::DeviceFound { name, address } => self.device_found(name, address, events),
            LinkEvent::ScanFailed { reason } => {
                if self.state == ConnectionState::Scanning {
                    warn!("Scan failed: {}", reason);
                    self.fail(NotConnectedReason::ScanFailed, events);
                }
            },
            LinkEvent::LinkEstablished => self.link_established(events),
            LinkEvent::LinkFailed { reason } => {
                if self.state == ConnectionState::Connecting {
                    warn!("Connecting to peripheral failed: {}", reason);
                    self.fail(NotConnectedReason::LinkFailed, events);
                }
            },
            LinkEvent::ServicesDiscovered { success } => self.services_discovered(success, events),
            LinkEvent::LinkDropped => {
                if matches!(self.state, ConnectionState::Connecting | ConnectionState::Discovering | ConnectionState::Connected) {
                    warn!("Connection lost");
                    self.fail(NotConnectedReason::LinkDropped, events);
                }
            },
            LinkEvent::ValueRead(bytes) => self.value_read(bytes, events),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.scan_deadline
    }

    fn timeout_elapsed(&mut self, events: &mut Vec<DeviceEvent>) {
        if self.state == ConnectionState::Scanning {
            info!("End of scan period, {} not found", self.config.device_name);
            self.fail(NotConnectedReason::ScanTimeout, events);
        }
        self.scan_deadline = None;
    }
}

/// Pretends to be connected to a device whose distance is the current time.
pub struct SimulatedSession {
    state: ConnectionState,
    closed: bool,
    last_seen_at: Option<SystemTime>,
}

impl SimulatedSession {
    pub fn new() -> Self {
        SimulatedSession {
            state: ConnectionState::Idle,
            closed: false,
            last_seen_at: None,
        }
    }
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

impl DeviceSession for SimulatedSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Simulated
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn last_seen_at(&self) -> Option<SystemTime> {
        self.last_seen_at
    }

    fn start(&mut self, events: &mut Vec<DeviceEvent>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        self.state = ConnectionState::Connected;
        self.last_seen_at = Some(SystemTime::now());
        events.push(DeviceEvent::Connected { label: SIMULATED_DEVICE_LABEL.to_string() });
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<DeviceEvent>) -> Result<Option<Reading>, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        if self.state != ConnectionState::Connected {
            events.push(DeviceEvent::NotConnected { reason: NotConnectedReason::NoLink });
            return Err(SessionError::NotConnected);
        }

        // goes through the decoder just like a payload from the real device
        let now = SystemTime::now();
        let payload = format!("{}{}", TAG_DISTANCE as char, epoch_millis(now));
        let reading = decode(payload.as_bytes());

        self.last_seen_at = Some(now);
        events.push(DeviceEvent::ValueAvailable { reading: reading.clone(), received_at: now });
        Ok(Some(reading))
    }

    fn stop(&mut self, events: &mut Vec<DeviceEvent>) {
        if self.state == ConnectionState::Connected {
            events.push(DeviceEvent::NotConnected { reason: NotConnectedReason::Stopped });
        }
        self.state = ConnectionState::Disconnected;
    }

    fn close(&mut self) {
        self.closed = true;
        self.state = ConnectionState::Disconnected;
    }
}
