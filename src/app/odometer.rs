use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::types::{LastKnown, ScanMode};
use crate::device::manager::EventEnvelope;
use crate::device::protocol::{InvalidReason, Reading};
use crate::device::types::DeviceEvent;

/// How many diagnostic messages are kept.
pub const MESSAGE_HISTORY: usize = 10;

pub fn whole_meters(millimeters: u64) -> u64 {
    millimeters / 1000
}

pub fn millimeter_remainder(millimeters: u64) -> u64 {
    millimeters % 1000
}

pub fn format_distance(millimeters: u64) -> String {
    format!("{} m {:03} mm", whole_meters(millimeters), millimeter_remainder(millimeters))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Scanning,
    Connected,
    NotConnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            LinkStatus::Scanning => "scanning",
            LinkStatus::Connected => "connected",
            LinkStatus::NotConnected => "not connected",
        };

        write!(f, "{}", result)
    }
}

/// What the consumer knows about the device, built from the events of the session manager.
#[derive(Debug, Clone)]
pub struct Odometer {
    pub distance_mm: u64,
    pub updated_at: Option<SystemTime>,
    pub scan_mode: ScanMode,
    pub device_label: Option<String>,
    pub status: LinkStatus,
    messages: VecDeque<String>,
    // (generation, sequence) of the newest envelope applied
    newest: Option<(u64, u64)>,
}

impl Odometer {
    pub fn from_last_known(last: &LastKnown) -> Self {
        Odometer {
            distance_mm: last.distance_mm,
            updated_at: last.updated_at(),
            scan_mode: last.scan_mode,
            device_label: last.device_label.clone(),
            status: LinkStatus::NotConnected,
            messages: VecDeque::new(),
            newest: None,
        }
    }

    pub fn to_last_known(&self) -> LastKnown {
        let updated_at_ms = self.updated_at
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);

        LastKnown {
            distance_mm: self.distance_mm,
            updated_at_ms,
            scan_mode: self.scan_mode,
            device_label: self.device_label.clone(),
        }
    }

    /// A different scan mode means a different device, so the stored distance no longer applies.
    pub fn switch_mode(&mut self, scan_mode: ScanMode) {
        if self.scan_mode != scan_mode {
            self.scan_mode = scan_mode;
            self.distance_mm = 0;
            self.updated_at = None;
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &String> {
        self.messages.iter()
    }

    fn push_message(&mut self, message: String) {
        if self.messages.len() == MESSAGE_HISTORY {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    fn apply_reading(&mut self, reading: &Reading, received_at: SystemTime) {
        match reading {
            Reading::Distance(millimeters) => {
                self.distance_mm = *millimeters;
                self.updated_at = Some(received_at);
            },
            Reading::Message(text) => self.push_message(text.clone()),
            Reading::Invalid { raw, reason } => {
                let content: String = raw.chars().skip(1).collect();
                let message = match reason {
                    InvalidReason::Empty => format!("Invalid message:{}", raw),
                    InvalidReason::NotANumber => format!("Not a number >>>{}<<<", content),
                    InvalidReason::UnknownType => format!("Unknown value:{}", content),
                };
                self.push_message(message);
            },
        }
    }

    /// Applies an envelope unless it is older than one already applied. Returns whether it was
    /// applied.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        let position = (envelope.generation, envelope.sequence);
        if self.newest.is_some_and(|newest| position <= newest) {
            return false;
        }
        self.newest = Some(position);

        match &envelope.event {
            DeviceEvent::Scanning => self.status = LinkStatus::Scanning,
            DeviceEvent::Connected { label } => {
                self.status = LinkStatus::Connected;
                self.device_label = Some(label.clone());
            },
            DeviceEvent::NotConnected { .. } => self.status = LinkStatus::NotConnected,
            DeviceEvent::ValueAvailable { reading, received_at } => self.apply_reading(reading, *received_at),
        }
        true
    }
}

impl fmt::Display for Odometer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {}] {}",
            format_distance(self.distance_mm),
            self.scan_mode,
            self.device_label.as_deref().unwrap_or("-"),
            self.status,
        )?;

        if let Some(updated_at) = self.updated_at {
            write!(f, " (updated {})", humantime::format_rfc3339_seconds(updated_at))?;
        }
        Ok(())
    }
}
