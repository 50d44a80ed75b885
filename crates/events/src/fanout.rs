//! Bounded, non-blocking fan-out to live observers.
//!
//! A process-wide subscriber registry with an explicit lifecycle: observers
//! are added on subscribe and removed on unsubscribe, on disconnect, or when
//! their bounded buffer fills up. Publication never blocks: a subscriber
//! that cannot keep up is dropped so the others (and the publisher) are not
//! held hostage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{self, SyncSender, TrySendError};

use crate::bus::{EventBus, Subscription};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Handle identifying a registered subscriber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

#[derive(Debug, PartialEq, Eq)]
pub enum FanOutError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

/// In-process fan-out bus with bounded per-subscriber buffers.
#[derive(Debug)]
pub struct FanOutBus<M> {
    subscribers: Mutex<Registry<M>>,
    capacity: usize,
}

#[derive(Debug)]
struct Registry<M> {
    next_id: u64,
    senders: HashMap<SubscriberId, SyncSender<M>>,
}

impl<M> FanOutBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// `capacity` is the per-subscriber buffer size; a subscriber whose
    /// buffer is full at publish time is dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Registry {
                next_id: 0,
                senders: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber and hand back its id + receiving end.
    pub fn register(&self) -> (SubscriberId, Subscription<M>) {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        let id = match self.subscribers.lock() {
            Ok(mut reg) => {
                reg.next_id += 1;
                let id = SubscriberId(reg.next_id);
                reg.senders.insert(id, tx);
                id
            }
            // Poisoned registry: the subscription is still returned, it just
            // never receives messages until the process restarts.
            Err(_) => SubscriberId(u64::MAX),
        };

        (id, Subscription::new(rx))
    }

    /// Remove a subscriber explicitly (on client disconnect).
    pub fn unregister(&self, id: SubscriberId) {
        if let Ok(mut reg) = self.subscribers.lock() {
            reg.senders.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|reg| reg.senders.len()).unwrap_or(0)
    }

    /// Deliver `message` to every live subscriber without blocking.
    ///
    /// Returns the number of subscribers reached. Full or disconnected
    /// subscribers are removed from the registry as part of the publish.
    pub fn broadcast(&self, message: M) -> Result<usize, FanOutError>
    where
        M: Clone,
    {
        let mut reg = self.subscribers.lock().map_err(|_| FanOutError::Poisoned)?;

        let mut delivered = 0usize;
        reg.senders.retain(|_, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        });

        Ok(delivered)
    }
}

impl<M> Default for FanOutBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for FanOutBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = FanOutError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.broadcast(message).map(|_| ())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.register().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let bus: FanOutBus<u32> = FanOutBus::new();
        let (_a, sub_a) = bus.register();
        let (_b, sub_b) = bus.register();

        assert_eq!(bus.broadcast(7).unwrap(), 2);
        assert_eq!(sub_a.try_recv().unwrap(), 7);
        assert_eq!(sub_b.try_recv().unwrap(), 7);
    }

    #[test]
    fn unregister_removes_subscriber() {
        let bus: FanOutBus<u32> = FanOutBus::new();
        let (id, _sub) = bus.register();
        assert_eq!(bus.subscriber_count(), 1);

        bus.unregister(id);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.broadcast(1).unwrap(), 0);
    }

    #[test]
    fn disconnected_subscriber_is_dropped_on_publish() {
        let bus: FanOutBus<u32> = FanOutBus::new();
        let (_id, sub) = bus.register();
        drop(sub);

        assert_eq!(bus.broadcast(1).unwrap(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_is_dropped_instead_of_blocking() {
        let bus: FanOutBus<u32> = FanOutBus::with_capacity(2);
        let (_slow, slow_sub) = bus.register();
        let (_live, live_sub) = bus.register();

        // Fill the slow subscriber's buffer without draining it.
        assert_eq!(bus.broadcast(1).unwrap(), 2);
        assert_eq!(bus.broadcast(2).unwrap(), 2);
        live_sub.drain();

        // Third publish finds the slow buffer full: the slow subscriber is
        // evicted, the healthy one still gets the message.
        assert_eq!(bus.broadcast(3).unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(live_sub.try_recv().unwrap(), 3);

        // The slow subscriber keeps whatever it had buffered.
        assert_eq!(slow_sub.drain(), vec![1, 2]);
    }
}
