use std::{collections::HashMap, sync::Arc};

use comms::{Qos, TopicPair, pubsub::Transport};
use log::{info, warn};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};

use super::{ClientSession, Inbound};
use crate::{AggregatorErr, Result};

/// Maps every client id to its single live `ClientSession`.
///
/// Sessions are fully built before they are inserted and removed before they are
/// torn down, lookups never observe a half constructed session.
pub struct SessionManager<T: Transport> {
    transport: T,
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    opening: Mutex<()>,
    inbound: mpsc::Sender<Inbound>,
}

impl<T: Transport> SessionManager<T> {
    /// Creates a new `SessionManager`.
    ///
    /// # Arguments
    /// * `transport` - The pub/sub connection every session is bound to.
    /// * `inbound` - Where the results of every session are forwarded.
    pub fn new(transport: T, inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(()),
            inbound,
        }
    }

    /// Opens the session of `client_id`.
    ///
    /// # Returns
    /// The new session, `DuplicateSession` if the client already has one or an io
    /// error if the inbound topic could not be subscribed.
    pub async fn open_session(&self, client_id: &str) -> Result<Arc<ClientSession>> {
        let _opening = self.opening.lock().await;

        if self.sessions.read().contains_key(client_id) {
            return Err(AggregatorErr::DuplicateSession(client_id.to_string()));
        }

        let topics = TopicPair::for_client(client_id);
        let subscription = self.transport.subscribe(&topics.to_aggregator).await?;
        let session = Arc::new(ClientSession::start(
            client_id.to_string(),
            topics,
            subscription,
            self.inbound.clone(),
        ));

        self.sessions
            .write()
            .insert(client_id.to_string(), session.clone());

        info!(client_id = client_id; "session opened");
        Ok(session)
    }

    /// Closes the session of `client_id`.
    ///
    /// # Returns
    /// `false` if the client had no session.
    pub async fn close_session(&self, client_id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(client_id) else {
            return false;
        };

        if let Err(e) = self.transport.unsubscribe(&session.topics().to_aggregator).await {
            warn!(client_id = client_id; "failed to unsubscribe a closed session: {e}");
        }

        info!(client_id = client_id; "session closed");
        true
    }

    /// Publishes `payload` to `client_id`.
    pub async fn publish_to(&self, client_id: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        let session = self
            .session(client_id)
            .ok_or_else(|| AggregatorErr::UnknownClient(client_id.to_string()))?;

        session.publish(&self.transport, payload, qos).await?;
        Ok(())
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Returns the ids of every open session.
    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Closes every open session.
    pub async fn close_all(&self) {
        for client_id in self.client_ids() {
            self.close_session(&client_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use comms::{
        envelope::{self, ResultEnvelope},
        pubsub::{MemoryBroker, MemoryTransport},
    };
    use model::ParameterMap;
    use tokio::time;

    use super::*;

    fn setup() -> (MemoryBroker, SessionManager<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let broker = MemoryBroker::new(8);
        let (tx, rx) = mpsc::channel(8);
        (broker.clone(), SessionManager::new(broker.connect(), tx), rx)
    }

    fn result(client_id: &str) -> Vec<u8> {
        let result = ResultEnvelope {
            round_index: 1,
            client_id: client_id.to_string(),
            parameters: ParameterMap::new(),
            sent_time_ms: 0,
        };
        envelope::to_bytes(&result).unwrap()
    }

    #[tokio::test]
    async fn test_second_open_is_a_duplicate() {
        let (broker, sessions, _rx) = setup();

        let session = sessions.open_session("h_0001").await.unwrap();
        assert_eq!(session.client_id(), "h_0001");

        let err = sessions.open_session("h_0001").await.unwrap_err();
        assert!(matches!(err, AggregatorErr::DuplicateSession(id) if id == "h_0001"));
        assert_eq!(sessions.len(), 1);
        assert_eq!(broker.subscribers(&session.topics().to_aggregator), 1);
    }

    #[tokio::test]
    async fn test_close_reports_whether_a_session_existed() {
        let (broker, sessions, _rx) = setup();
        let topic = TopicPair::for_client("h_0001").to_aggregator;

        sessions.open_session("h_0001").await.unwrap();
        assert!(sessions.close_session("h_0001").await);
        assert!(!sessions.close_session("h_0001").await);
        assert_eq!(broker.subscribers(&topic), 0);

        sessions.open_session("h_0001").await.unwrap();
        assert!(sessions.contains("h_0001"));
    }

    #[tokio::test]
    async fn test_results_are_forwarded_per_client() {
        let (broker, sessions, mut rx) = setup();
        let client = broker.connect();
        sessions.open_session("h_0001").await.unwrap();
        let topic = TopicPair::for_client("h_0001").to_aggregator;

        client.publish(&topic, vec![1, 2, 3], Qos::ExactlyOnce).await.unwrap();
        client.publish(&topic, result("h_9999"), Qos::ExactlyOnce).await.unwrap();
        client.publish(&topic, result("h_0001"), Qos::ExactlyOnce).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.client_id, "h_0001");
        assert_eq!(inbound.envelope.client_id, "h_0001");

        sessions.close_session("h_0001").await;
        client.publish(&topic, result("h_0001"), Qos::ExactlyOnce).await.unwrap();
        assert!(time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_client_fails() {
        let (_broker, sessions, _rx) = setup();

        let err = sessions
            .publish_to("nobody", vec![0], Qos::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorErr::UnknownClient(_)));
    }
}
