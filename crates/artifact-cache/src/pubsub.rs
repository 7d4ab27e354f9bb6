//! A small in-process fan-out notification bus.
//!
//! Every subscriber gets its own bounded channel. [`PubSub::publish`] delivers the
//! value to *all* live subscribers and only completes once each of them has accepted
//! it, so a subscriber that stops draining its channel backpressures the publisher.
//! Subscribers are expected to either keep up or close their subscription promptly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

struct Registry<T> {
    subscribers: HashMap<u64, mpsc::Sender<T>>,
    next_id: u64,
}

/// A fan-out bus delivering published values to every live [`Subscription`].
pub struct PubSub<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> PubSub<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                subscribers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Registers a new subscriber with a channel buffer of `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; subscriptions are always buffered.
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity);

        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);

        Subscription {
            registry: Arc::clone(&self.registry),
            id,
            rx,
        }
    }

    /// Closes every live subscription; their pending values stay receivable.
    pub fn close_all(&self) {
        self.registry.lock().unwrap().subscribers.clear();
    }
}

impl<T: Clone> PubSub<T> {
    /// Delivers `value` to every live subscriber, waiting until all of them accept it.
    pub async fn publish(&self, value: T) {
        let senders: Vec<_> = {
            let registry = self.registry.lock().unwrap();
            registry.subscribers.values().cloned().collect()
        };

        for sender in senders {
            // A send only fails when the subscription was closed concurrently.
            let _ = sender.send(value.clone()).await;
        }
    }
}

impl<T> Default for PubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's end of a [`PubSub`] bus.
pub struct Subscription<T> {
    registry: Arc<Mutex<Registry<T>>>,
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Receives the next published value, or `None` once the subscription is closed
    /// and its buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Deregisters this subscriber. Idempotent; also invoked on drop.
    ///
    /// Values already sitting in the buffer remain receivable, further publishes
    /// skip this subscriber.
    pub fn close(&mut self) {
        self.registry.lock().unwrap().subscribers.remove(&self.id);
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}
