//! Publish/subscribe fan-out of transaction state changes
// (c) 2025 Ross Younger

use tokio::sync::broadcast;
use tracing::warn;

use super::Fields;

/// Events buffered per subscriber before it starts losing them
const EVENT_BACKLOG: usize = 1024;

/// One state change
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Channel (topic) the change was published on
    pub channel: String,
    /// Transaction tag
    pub tag: String,
    /// The fields that changed, with their new values
    pub fields: Fields,
}

/// Fans events out to subscribers.
///
/// Events published on one bus are delivered to every subscriber in publication order.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BACKLOG);
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to the given channels. An empty list means every channel.
    #[must_use]
    pub fn subscribe(&self, channels: &[&str]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            channels: channels.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A subscriber's handle on an [`EventBus`]
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    channels: Vec<String>,
}

impl Subscription {
    fn wants(&self, event: &Event) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| *c == event.channel)
    }

    /// Waits for the next matching event. Returns `None` once the bus has gone away.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => (),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event subscriber fell behind; {n} events lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event if one is already waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => (),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("event subscriber fell behind; {n} events lost");
                }
                Err(_) => return None,
            }
        }
    }
}
