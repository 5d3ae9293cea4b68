use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};
use tokio::sync::broadcast::{self, error::RecvError};

pub(crate) mod events;

use events::{ProxyEvent, RotationEvent, TopologyEvent};

/// A single pub/sub topic.
///
/// Every subscriber reads the topic's bounded ring buffer through its own cursor, so publishing
/// never waits for anyone. A subscriber that falls more than the buffer size behind loses the
/// oldest events it has not read yet; those drops are counted and logged.
pub(crate) struct Topic<T> {
    name: &'static str,
    sender: broadcast::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T: Clone> Topic<T> {
    pub(crate) fn new(name: &'static str, buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            name,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to all current subscribers, returning how many there were. Never blocks.
    pub(crate) fn publish(&self, event: T) -> usize {
        // Only fails when nobody is subscribed, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Events published from now on, in publish order. No replay of earlier events.
    pub(crate) fn subscribe(&self) -> Subscription<T> {
        Subscription {
            topic: self.name,
            receiver: self.sender.subscribe(),
            dropped: 0,
            topic_dropped: self.dropped.clone(),
        }
    }

    /// Events lost by lagging subscribers, summed over all subscribers
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Relaxed)
    }
}

pub(crate) struct Subscription<T> {
    topic: &'static str,
    receiver: broadcast::Receiver<T>,
    dropped: u64,
    topic_dropped: Arc<AtomicU64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Received<T> {
    Event(T),
    /// This many events were lost before the next one. Whatever they would have triggered has to
    /// be recomputed from current state.
    Lagged(u64),
}

impl<T: Clone> Subscription<T> {
    /// Next event or lag notice, `None` once the topic is gone
    pub(crate) async fn recv(&mut self) -> Option<Received<T>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Received::Event(event)),
            Err(RecvError::Lagged(skipped)) => {
                self.dropped += skipped;
                self.topic_dropped.fetch_add(skipped, Relaxed);
                log::warn!("subscriber on {} lagged, dropped {} oldest events", self.topic, skipped);
                Some(Received::Lagged(skipped))
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
impl<T: Clone> Subscription<T> {
    /// Next event, stepping over lag notices
    pub(crate) async fn next_event(&mut self) -> Option<T> {
        loop {
            if let Received::Event(event) = self.recv().await? {
                return Some(event);
            }
        }
    }
}

/// The topics the control plane components talk over
pub(crate) struct EventBroker {
    pub(crate) rotations: Topic<RotationEvent>,
    pub(crate) proxies: Topic<ProxyEvent>,
    pub(crate) topology: Topic<TopologyEvent>,
}

impl EventBroker {
    pub(crate) fn new(subscriber_buffer: usize) -> Self {
        Self {
            rotations: Topic::new("rotations", subscriber_buffer),
            proxies: Topic::new("proxies", subscriber_buffer),
            topology: Topic::new("topology", subscriber_buffer),
        }
    }

    pub(crate) fn dropped_events(&self) -> u64 {
        self.rotations.dropped() + self.proxies.dropped() + self.topology.dropped()
    }
}
