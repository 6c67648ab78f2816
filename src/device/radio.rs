//! The contract between a live session and the platform radio.
//!
//! Every request is fire-and-forget: a `RadioLink` method only fails when the request can not be
//! issued at all. The outcome is delivered later as a `LinkEvent` through the `LinkEventSender`
//! the link was opened with. A request may also never produce an outcome.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{FutureExt, StreamExt};
use log::debug;
use uuid::Uuid;

use crate::device::types::{DeviceAddress, LinkEvent};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub device_name: String,
    pub service: Uuid,
}

pub trait RadioLink: Send {
    fn start_discovery(&mut self, filter: &DiscoveryFilter) -> Result<(), DeviceError>;

    /// Best effort, never reported.
    fn stop_discovery(&mut self);

    fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError>;

    fn discover_services(&mut self) -> Result<(), DeviceError>;

    fn read_characteristic(&mut self, id: Uuid) -> Result<(), DeviceError>;

    /// Best effort, never reported.
    fn disconnect(&mut self);

    /// Releases the link. No events are sent after this returns.
    fn close(&mut self);
}

/// Opens one `RadioLink` per live session.
pub trait RadioProvider: Send {
    fn open(&mut self, events: LinkEventSender) -> Result<Box<dyn RadioLink>, DeviceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLinkEvent {
    pub generation: u64,
    pub event: LinkEvent,
}

/// Sends link events tagged with the generation of the session that owns the link.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    generation: u64,
    sender: UnboundedSender<TaggedLinkEvent>,
}

impl LinkEventSender {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, event: LinkEvent) {
        let tagged = TaggedLinkEvent { generation: self.generation, event };

        if let Err(err) = self.sender.unbounded_send(tagged) {
            debug!("Link event receiver is gone, dropping {:?}", err.into_inner().event);
        }
    }
}

/// Hands out a `LinkEventSender` per generation, all feeding the same `LinkInbox`.
#[derive(Debug, Clone)]
pub struct LinkSenders {
    sender: UnboundedSender<TaggedLinkEvent>,
}

impl LinkSenders {
    pub fn for_generation(&self, generation: u64) -> LinkEventSender {
        LinkEventSender { generation, sender: self.sender.clone() }
    }
}

/// Receiving end of all link events, for every generation.
pub struct LinkInbox {
    receiver: UnboundedReceiver<TaggedLinkEvent>,
}

impl LinkInbox {
    pub fn new() -> (LinkSenders, LinkInbox) {
        let (sender, receiver) = unbounded::<TaggedLinkEvent>();
        (LinkSenders { sender }, LinkInbox { receiver })
    }

    /// Waits for the next event. Returns `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<TaggedLinkEvent> {
        self.receiver.next().await
    }

    /// Returns an event if one is queued, without waiting.
    pub fn try_next(&mut self) -> Option<TaggedLinkEvent> {
        self.receiver.next().now_or_never().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_the_generation_of_their_sender() {
        let (senders, mut inbox) = LinkInbox::new();
        let first = senders.for_generation(1);
        let second = senders.for_generation(2);

        second.send(LinkEvent::LinkEstablished);
        first.send(LinkEvent::LinkDropped);

        assert_eq!(inbox.try_next(), Some(TaggedLinkEvent { generation: 2, event: LinkEvent::LinkEstablished }));
        assert_eq!(inbox.try_next(), Some(TaggedLinkEvent { generation: 1, event: LinkEvent::LinkDropped }));
        assert_eq!(inbox.try_next(), None);
    }
}
