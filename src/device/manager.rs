//! Owns at most one device session and relays its events to the consumer.
//!
//! Every session gets a new generation number. Link events that arrive for any generation other
//! than the active one belong to a session that is already closed and are dropped, so nothing a
//! closed session does can reach the `EventSink`.

use std::time::SystemTime;
use futures::channel::mpsc::{Sender, UnboundedSender};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::types::DeviceConfig;
use crate::device::protocol::Reading;
use crate::device::radio::{LinkInbox, LinkSenders, RadioProvider, TaggedLinkEvent};
use crate::device::session::{DeviceSession, LiveSession, SimulatedSession};
use crate::device::types::{ConnectionState, DeviceEvent, SessionKind};
use crate::error::SessionError;

/// A session event as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub generation: u64,
    /// Increases by one for every event emitted by the manager, across sessions.
    pub sequence: u64,
    pub emitted_at: SystemTime,
    pub event: DeviceEvent,
}

pub trait EventSink: Send {
    fn emit(&mut self, envelope: EventEnvelope);
}

impl EventSink for UnboundedSender<EventEnvelope> {
    fn emit(&mut self, envelope: EventEnvelope) {
        if let Err(err) = self.unbounded_send(envelope) {
            debug!("Event receiver is gone, dropping {:?}", err.into_inner().event);
        }
    }
}

impl EventSink for Sender<EventEnvelope> {
    fn emit(&mut self, envelope: EventEnvelope) {
        if let Err(err) = self.try_send(envelope) {
            warn!("Failed to deliver event (full: {}): {:?}", err.is_full(), err.into_inner().event);
        }
    }
}

struct ActiveSession {
    generation: u64,
    session: Box<dyn DeviceSession>,
}

pub struct SessionManager {
    config: DeviceConfig,
    radio: Box<dyn RadioProvider>,
    sink: Box<dyn EventSink>,
    links: LinkSenders,
    active: Option<ActiveSession>,
    generation: u64,
    sequence: u64,
}

impl SessionManager {
    /// Also returns the inbox that receives the events of every radio link this manager opens.
    /// Whoever drives the manager hands them back through `dispatch`.
    pub fn new(config: DeviceConfig, radio: Box<dyn RadioProvider>, sink: Box<dyn EventSink>) -> (Self, LinkInbox) {
        let (links, inbox) = LinkInbox::new();
        let manager = SessionManager {
            config,
            radio,
            sink,
            links,
            active: None,
            generation: 0,
            sequence: 0,
        };
        (manager, inbox)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_active_session(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.generation)
    }

    pub fn kind(&self) -> Option<SessionKind> {
        self.active.as_ref().map(|active| active.session.kind())
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.active.as_ref().map(|active| active.session.state())
    }

    pub fn last_seen_at(&self) -> Option<SystemTime> {
        self.active.as_ref().and_then(|active| active.session.last_seen_at())
    }

    /// Closes the active session, if any, then starts a new one of the requested kind.
    pub fn start_scan(&mut self, simulated: bool) -> Result<(), SessionError> {
        self.close();

        self.generation += 1;
        let generation = self.generation;
        let kind = SessionKind::from_simulated(simulated);
        info!("Starting {:?} session (generation {})", kind, generation);

        let session: Box<dyn DeviceSession> = match kind {
            SessionKind::Simulated => Box::new(SimulatedSession::new()),
            SessionKind::Live { .. } => {
                let link = self.radio.open(self.links.for_generation(generation))
                    .map_err(|source| SessionError::RadioUnavailable { source })?;
                Box::new(LiveSession::new(self.config.clone(), link))
            },
        };

        let active = self.active.insert(ActiveSession { generation, session });
        let mut events = Vec::new();
        let result = active.session.start(&mut events);
        self.forward(generation, events);
        result
    }

    /// Asks the active session for one value. Without a session this only reports
    /// `SessionError::NotConnected`; no event is emitted.
    pub fn poll(&mut self) -> Result<Option<Reading>, SessionError> {
        let Some(active) = self.active.as_mut() else {
            debug!("Poll without an active session");
            return Err(SessionError::NotConnected);
        };

        let generation = active.generation;
        let mut events = Vec::new();
        let result = active.session.poll(&mut events);
        self.forward(generation, events);
        result
    }

    /// Stops the active session and releases it. The resulting `NotConnected` event is the last
    /// event emitted until the next `start_scan`.
    pub fn disconnect(&mut self) {
        let Some(mut active) = self.active.take() else { return };

        let mut events = Vec::new();
        active.session.stop(&mut events);
        active.session.close();
        self.forward(active.generation, events);
        info!("Disconnected session (generation {})", active.generation);
    }

    /// Releases the active session without emitting anything.
    pub fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.session.close();
            info!("Closed session (generation {})", active.generation);
        }
    }

    pub fn dispatch(&mut self, tagged: TaggedLinkEvent) {
        let Some(active) = self.active.as_mut().filter(|active| active.generation == tagged.generation) else {
            debug!("Dropping stale link event of generation {}: {:?}", tagged.generation, tagged.event);
            return;
        };

        let generation = active.generation;
        let mut events = Vec::new();
        active.session.handle_link_event(tagged.event, &mut events);
        self.forward(generation, events);
    }

    /// Dispatches every link event that is already queued in `inbox`.
    pub fn dispatch_pending(&mut self, inbox: &mut LinkInbox) {
        while let Some(tagged) = inbox.try_next() {
            self.dispatch(tagged);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|active| active.session.deadline())
    }

    /// Fires the active session's timeout if its deadline is at or before `now`.
    pub fn tick(&mut self, now: Instant) {
        let Some(active) = self.active.as_mut() else { return };

        match active.session.deadline() {
            Some(deadline) if deadline <= now => {
                let generation = active.generation;
                let mut events = Vec::new();
                active.session.timeout_elapsed(&mut events);
                self.forward(generation, events);
            },
            _ => {},
        }
    }

    fn forward(&mut self, generation: u64, events: Vec<DeviceEvent>) {
        for event in events {
            self.sequence += 1;
            debug!("Event #{} (generation {}): {:?}", self.sequence, generation, event);
            self.sink.emit(EventEnvelope {
                generation,
                sequence: self.sequence,
                emitted_at: SystemTime::now(),
                event,
            });
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}
