use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Delivery, Subscription, Transport};
use crate::Qos;

struct Subscriber {
    conn: u64,
    tx: mpsc::Sender<Delivery>,
}

struct Inner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_conn: AtomicU64,
    capacity: usize,
}

/// An in process broker, every subscription owns a bounded queue.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a new `MemoryBroker`.
    ///
    /// # Arguments
    /// * `capacity` - The amount of undelivered messages a subscription can hold
    ///                before publishers start waiting.
    pub fn new(capacity: usize) -> Self {
        let inner = Inner {
            topics: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            capacity: capacity.max(1),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryTransport {
        MemoryTransport {
            inner: self.inner.clone(),
            conn: self.inner.next_conn.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns the amount of live subscriptions on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or_default()
    }
}

/// A connection to a `MemoryBroker`.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
    conn: u64,
}

impl Transport for MemoryTransport {
    async fn subscribe(&self, topic: &str) -> io::Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let sub = Subscriber {
            conn: self.conn,
            tx,
        };

        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(sub);

        debug!(topic = topic, conn = self.conn; "subscribed");
        Ok(Subscription::new(topic.to_string(), rx))
    }

    async fn unsubscribe(&self, topic: &str) -> io::Result<()> {
        let mut topics = self.inner.topics.lock();

        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.conn != self.conn);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> io::Result<()> {
        let targets: Vec<mpsc::Sender<Delivery>> = {
            let mut topics = self.inner.topics.lock();
            let Some(subs) = topics.get_mut(topic) else {
                debug!(topic = topic; "published on a topic with no subscribers");
                return Ok(());
            };

            subs.retain(|s| !s.tx.is_closed());
            subs.iter().map(|s| s.tx.clone()).collect()
        };

        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.into(),
        };

        for tx in targets {
            if qos.needs_ack() {
                // A subscriber that went away in between is not a publish failure.
                let _ = tx.send(delivery.clone()).await;
                continue;
            }

            if let Err(TrySendError::Full(_)) = tx.try_send(delivery.clone()) {
                debug!(topic = topic; "dropped an at most once message on a full queue");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_a_copy_in_order() {
        let broker = MemoryBroker::new(8);
        let (a, b) = (broker.connect(), broker.connect());
        let publisher = broker.connect();

        let mut sub_a = a.subscribe("t").await.unwrap();
        let mut sub_b = b.subscribe("t").await.unwrap();

        for i in 0..3u8 {
            publisher.publish("t", vec![i], Qos::ExactlyOnce).await.unwrap();
        }

        for sub in [&mut sub_a, &mut sub_b] {
            for i in 0..3u8 {
                let delivery = sub.recv().await.unwrap();
                assert_eq!(&*delivery.payload, &[i]);
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_only_affects_own_connection() {
        let broker = MemoryBroker::new(8);
        let (a, b) = (broker.connect(), broker.connect());

        let mut sub_a = a.subscribe("t").await.unwrap();
        let _sub_b = b.subscribe("t").await.unwrap();

        a.unsubscribe("t").await.unwrap();
        assert_eq!(broker.subscribers("t"), 1);
        assert!(sub_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let broker = MemoryBroker::new(1);
        let conn = broker.connect();

        let sub = conn.subscribe("t").await.unwrap();
        drop(sub);

        conn.publish("t", vec![1], Qos::AtLeastOnce).await.unwrap();
        assert_eq!(broker.subscribers("t"), 0);
    }
}
