use std::io;

use comms::{
    Deserialize, Qos, TopicPair,
    envelope::ResultEnvelope,
    pubsub::{Subscription, Transport},
};
use log::{debug, warn};
use tokio::sync::mpsc;

/// A result received from a client, already decoded.
#[derive(Debug)]
pub struct Inbound {
    pub client_id: String,
    pub envelope: ResultEnvelope,
}

/// The communication endpoint of a single client.
///
/// The session forwards every result published on the client's inbound topic into
/// the shared inbound queue. Forwarding stops once the topic is unsubscribed and
/// the results already delivered were drained.
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    topics: TopicPair,
}

impl ClientSession {
    /// Creates a new `ClientSession` and starts forwarding `subscription`.
    pub(super) fn start(
        client_id: String,
        topics: TopicPair,
        subscription: Subscription,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        tokio::spawn(forward(client_id.clone(), subscription, inbound));

        Self { client_id, topics }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topics(&self) -> &TopicPair {
        &self.topics
    }

    /// Publishes `payload` on the client's outbound topic.
    pub(super) async fn publish<T: Transport>(
        &self,
        transport: &T,
        payload: Vec<u8>,
        qos: Qos,
    ) -> io::Result<()> {
        transport.publish(&self.topics.to_client, payload, qos).await
    }
}

async fn forward(client_id: String, mut subscription: Subscription, inbound: mpsc::Sender<Inbound>) {
    while let Some(delivery) = subscription.recv().await {
        let envelope = match ResultEnvelope::deserialize(&delivery.payload[..]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client_id = client_id.as_str(); "dropping a malformed result: {e}");
                continue;
            }
        };

        if envelope.client_id != client_id {
            warn!(
                client_id = client_id.as_str(),
                claimed = envelope.client_id.as_str();
                "dropping a result published on another client's topic"
            );
            continue;
        }

        debug!(client_id = client_id.as_str(), round = envelope.round_index; "result received");

        let msg = Inbound {
            client_id: client_id.clone(),
            envelope,
        };

        if inbound.send(msg).await.is_err() {
            break;
        }
    }

    debug!(client_id = client_id.as_str(); "session forwarder stopped");
}
