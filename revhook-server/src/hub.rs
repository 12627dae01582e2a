//! In-process pub/sub for live status streams.
//!
//! Delivery is best-effort: `publish` never waits on a subscriber. A client
//! whose channel is full misses that event; the job pipeline never stalls on
//! a slow browser tab.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Per-client buffer used when the caller doesn't choose one.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

struct Client<T> {
    generation: u64,
    sender: mpsc::Sender<T>,
}

pub struct EventHub<T> {
    name: &'static str,
    buffer: usize,
    next_generation: AtomicU64,
    clients: RwLock<HashMap<String, Client<T>>>,
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new(name: &'static str, buffer: usize) -> Self {
        Self {
            name,
            buffer: buffer.max(1),
            next_generation: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register `client_id` and return its delivery channel.
    ///
    /// Subscribing an id that is already registered replaces the old
    /// channel, which then closes.
    pub fn subscribe(&self, client_id: impl Into<String>) -> mpsc::Receiver<T> {
        self.subscribe_inner(client_id.into()).1
    }

    /// Like [`subscribe`](Self::subscribe), but the returned handle
    /// unsubscribes itself when dropped.
    pub fn subscribe_guarded(self: &Arc<Self>, client_id: impl Into<String>) -> Subscription<T> {
        let client_id = client_id.into();
        let (generation, receiver) = self.subscribe_inner(client_id.clone());
        Subscription {
            hub: Arc::clone(self),
            client_id,
            generation,
            receiver,
        }
    }

    fn subscribe_inner(&self, client_id: String) -> (u64, mpsc::Receiver<T>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.insert(client_id.clone(), Client { generation, sender });
        debug!(hub = self.name, client = %client_id, clients = clients.len(), "Client subscribed");
        (generation, receiver)
    }

    /// Remove `client_id`, closing its channel. Returns whether it was subscribed.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.remove(client_id).is_some()
    }

    fn unsubscribe_generation(&self, client_id: &str, generation: u64) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients
            .get(client_id)
            .is_some_and(|c| c.generation == generation)
        {
            clients.remove(client_id);
        }
    }

    /// Fan `event` out to every subscriber without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: T) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            for (client_id, client) in clients.iter() {
                match client.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(
                            hub = self.name,
                            client = %client_id,
                            "Subscriber lagging, event dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => gone.push(client_id.clone()),
                }
            }
        }

        if !gone.is_empty() {
            let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            for client_id in gone {
                if clients
                    .get(&client_id)
                    .is_some_and(|c| c.sender.is_closed())
                {
                    clients.remove(&client_id);
                }
            }
        }

        delivered
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every subscriber, ending their streams.
    pub fn close(&self) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A hub subscription tied to a connection's lifetime.
pub struct Subscription<T: Clone + Send + 'static> {
    hub: Arc<EventHub<T>>,
    client_id: String,
    generation: u64,
    receiver: mpsc::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next event, or `None` once the hub has dropped this client.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.hub
            .unsubscribe_generation(&self.client_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = EventHub::new("test", 8);
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        assert_eq!(hub.publish(1u32), 2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(hub.client_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let hub = EventHub::new("test", 4);
        let _stalled = hub.subscribe("stalled");
        let mut live = hub.subscribe("live");

        let publishing = async {
            for i in 0..100u32 {
                hub.publish(i);
                assert_eq!(live.recv().await, Some(i));
            }
        };
        tokio::time::timeout(Duration::from_secs(2), publishing)
            .await
            .expect("publish must never wait on a stalled subscriber");

        // The stalled client kept only what fit in its buffer.
        assert_eq!(hub.client_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let hub = EventHub::new("test", 4);
        let mut rx = hub.subscribe("a");

        assert!(hub.unsubscribe("a"));
        assert_eq!(rx.recv().await, None::<u32>);
        assert!(!hub.unsubscribe("a"));
        assert_eq!(hub.publish(7), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_old_channel() {
        let hub = EventHub::new("test", 4);
        let mut old = hub.subscribe("a");
        let mut new = hub.subscribe("a");

        assert_eq!(old.recv().await, None::<u32>);
        hub.publish(3);
        assert_eq!(new.recv().await, Some(3));
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_publish() {
        let hub = EventHub::new("test", 4);
        drop(hub.subscribe("gone"));
        assert_eq!(hub.client_count(), 1);

        assert_eq!(hub.publish(1u8), 0);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_guard_unsubscribes_on_drop() {
        let hub = Arc::new(EventHub::<u8>::new("test", 4));
        let sub = hub.subscribe_guarded("conn-1");
        assert_eq!(sub.client_id(), "conn-1");
        assert_eq!(hub.client_count(), 1);

        drop(sub);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_guard_leaves_newer_subscription() {
        let hub = Arc::new(EventHub::new("test", 4));
        let first = hub.subscribe_guarded("conn");
        let mut second = hub.subscribe_guarded("conn");

        drop(first);
        assert_eq!(hub.client_count(), 1);
        hub.publish(5u16);
        assert_eq!(second.recv().await, Some(5));
    }

    #[tokio::test]
    async fn test_close_ends_all_streams() {
        let hub = Arc::new(EventHub::new("test", 4));
        let mut sub = hub.subscribe_guarded("x");
        hub.close();
        assert_eq!(sub.recv().await, None::<i32>);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let hub = Arc::new(EventHub::new("test", 1024));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut sub = hub.subscribe_guarded(format!("c{}", i));
                hub.publish(i);
                // At least our own event arrives.
                sub.recv().await.is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(hub.client_count(), 0);
    }
}
