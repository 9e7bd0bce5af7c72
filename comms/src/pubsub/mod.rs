//! Topic based publish/subscribe transports.

mod broker;
mod memory;
mod remote;

use std::{io, sync::Arc};

use tokio::sync::mpsc;

use crate::Qos;

pub use broker::BrokerServer;
pub use memory::{MemoryBroker, MemoryTransport};
pub use remote::{RemoteConfig, RemoteTransport};

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Arc<[u8]>,
}

/// The receiving end of a topic subscription.
///
/// Messages of a single topic arrive in the order they were published. Dropping
/// the subscription stops the deliveries.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(topic: String, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next delivery.
    ///
    /// # Returns
    /// `None` once the transport is gone or the topic was unsubscribed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// A connection to a pub/sub broker.
///
/// Implementors are cheap handles, cloning one shares the same connection.
#[allow(unused)]
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport: Clone + Sync + 'static {
    /// Starts receiving every message published on `topic`.
    ///
    /// # Arguments
    /// * `topic` - The exact topic name.
    ///
    /// # Returns
    /// The subscription once the broker registered it, or an io error.
    async fn subscribe(&self, topic: &str) -> io::Result<Subscription>;

    /// Stops every subscription this connection holds on `topic`.
    async fn unsubscribe(&self, topic: &str) -> io::Result<()>;

    /// Publishes `payload` on `topic`.
    ///
    /// # Arguments
    /// * `topic` - The exact topic name.
    /// * `payload` - The opaque message.
    /// * `qos` - The delivery guarantee, anything above `AtMostOnce` waits for the broker.
    ///
    /// # Returns
    /// An io error if the message could not be handed to the broker.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> io::Result<()>;
}
