use std::collections::{BTreeSet, HashMap};

use log::{debug, info};
use parking_lot::Mutex;
use rand::{Rng, distr::Alphanumeric};

use crate::{AggregatorErr, Result};

const SUFFIX_LEN: usize = 4;

/// Where a client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Joined,
    Training,
    Finished,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    host_id: String,
    state: RegistrationState,
}

/// Tracks the identity and participation of every client.
///
/// The records, the feasible set and the finished list live behind separate locks,
/// joins and quits never wait on result processing. When both locks are needed the
/// records lock is always taken first.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    records: Mutex<HashMap<String, ClientRecord>>,
    feasible: Mutex<BTreeSet<String>>,
    finished: Mutex<Vec<String>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new client for `host_id`.
    ///
    /// # Returns
    /// A fresh client id, `host_id` followed by a short random suffix.
    pub fn register(&self, host_id: &str) -> String {
        let mut records = self.records.lock();
        let mut rng = rand::rng();

        let client_id = loop {
            let suffix: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(SUFFIX_LEN)
                .map(char::from)
                .collect();

            let candidate = format!("{host_id}_{suffix}");
            if !records.contains_key(&candidate) {
                break candidate;
            }
        };

        let record = ClientRecord {
            host_id: host_id.to_string(),
            state: RegistrationState::Registered,
        };
        records.insert(client_id.clone(), record);

        info!(client_id = client_id.as_str(), host_id = host_id; "client registered");
        client_id
    }

    /// Adds `client_id` to the feasible set, joining twice has no extra effect.
    pub fn join(&self, client_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(client_id) else {
            return Err(AggregatorErr::UnknownClient(client_id.to_string()));
        };

        if record.state == RegistrationState::Registered {
            record.state = RegistrationState::Joined;
        }

        if self.feasible.lock().insert(client_id.to_string()) {
            info!(client_id = client_id, host_id = record.host_id.as_str(); "client joined");
        }

        Ok(())
    }

    /// Removes `client_id` from the feasible set and forgets its record.
    ///
    /// Registering again afterwards yields a new client id.
    pub fn quit(&self, client_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        if !self.feasible.lock().remove(client_id) {
            return Err(AggregatorErr::UnknownClient(client_id.to_string()));
        }

        records.remove(client_id);
        info!(client_id = client_id; "client quit");
        Ok(())
    }

    /// Marks `client_id` as done with the current round.
    pub fn record_finished(&self, client_id: &str) {
        if let Some(record) = self.records.lock().get_mut(client_id) {
            record.state = RegistrationState::Finished;
        }

        let mut finished = self.finished.lock();
        if !finished.iter().any(|id| id == client_id) {
            finished.push(client_id.to_string());
        }
    }

    /// Forgets who finished, called at the start of every round.
    pub fn clear_finished(&self) {
        self.finished.lock().clear();
    }

    /// Returns the clients that finished the current round, in arrival order.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    /// Moves `participants` into training for the round about to start.
    pub fn mark_training(&self, participants: &[String]) {
        let mut records = self.records.lock();

        for client_id in participants {
            if let Some(record) = records.get_mut(client_id) {
                record.state = RegistrationState::Training;
            }
        }

        debug!("{} clients training", participants.len());
    }

    /// Returns a sorted snapshot of the feasible set.
    pub fn joined(&self) -> Vec<String> {
        self.feasible.lock().iter().cloned().collect()
    }

    pub fn joined_count(&self) -> usize {
        self.feasible.lock().len()
    }

    pub fn is_joined(&self, client_id: &str) -> bool {
        self.feasible.lock().contains(client_id)
    }

    pub fn state(&self, client_id: &str) -> Option<RegistrationState> {
        self.records.lock().get(client_id).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_register_yields_unique_ids_for_the_same_host() {
        let registry = ClientRegistry::new();
        let ids: BTreeSet<String> = (0..200).map(|_| registry.register("host")).collect();

        assert_eq!(ids.len(), 200);
        for id in &ids {
            let (host, suffix) = id.rsplit_once('_').unwrap();
            assert_eq!(host, "host");
            assert_eq!(suffix.len(), SUFFIX_LEN);
            assert_eq!(registry.state(id), Some(RegistrationState::Registered));
        }
    }

    #[test]
    fn test_join_unknown_client_fails() {
        let registry = ClientRegistry::new();

        let err = registry.join("ghost_0000").unwrap_err();
        assert!(matches!(err, AggregatorErr::UnknownClient(id) if id == "ghost_0000"));
        assert!(registry.joined().is_empty());
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = ClientRegistry::new();
        let id = registry.register("h");

        registry.join(&id).unwrap();
        registry.join(&id).unwrap();

        assert_eq!(registry.joined(), vec![id.clone()]);
        assert_eq!(registry.state(&id), Some(RegistrationState::Joined));
    }

    #[test]
    fn test_join_then_quit_restores_the_feasible_set() {
        let registry = ClientRegistry::new();
        let stays = registry.register("a");
        registry.join(&stays).unwrap();
        let before = registry.joined();

        let leaves = registry.register("b");
        registry.join(&leaves).unwrap();
        registry.quit(&leaves).unwrap();

        assert_eq!(registry.joined(), before);
        assert_eq!(registry.state(&leaves), None);
    }

    #[test]
    fn test_quit_never_joined_client_fails_and_changes_nothing() {
        let registry = ClientRegistry::new();
        let joined = registry.register("a");
        registry.join(&joined).unwrap();
        let registered = registry.register("b");
        let before = registry.joined();

        assert!(matches!(
            registry.quit(&registered),
            Err(AggregatorErr::UnknownClient(_))
        ));
        assert!(matches!(
            registry.quit("never_seen"),
            Err(AggregatorErr::UnknownClient(_))
        ));
        assert_eq!(registry.joined(), before);
        assert_eq!(registry.state(&registered), Some(RegistrationState::Registered));
    }

    #[test]
    fn test_quit_then_register_again_gets_a_new_id() {
        let registry = ClientRegistry::new();
        let first = registry.register("h");
        registry.join(&first).unwrap();
        registry.quit(&first).unwrap();

        let second = registry.register("h");
        assert_ne!(first, second);
        assert!(matches!(registry.join(&first), Err(AggregatorErr::UnknownClient(_))));
        registry.join(&second).unwrap();
    }

    #[test]
    fn test_finished_list_is_deduplicated_and_cleared() {
        let registry = ClientRegistry::new();
        let id = registry.register("h");
        registry.join(&id).unwrap();

        registry.mark_training(std::slice::from_ref(&id));
        assert_eq!(registry.state(&id), Some(RegistrationState::Training));

        registry.record_finished(&id);
        registry.record_finished(&id);
        assert_eq!(registry.finished(), vec![id.clone()]);
        assert_eq!(registry.state(&id), Some(RegistrationState::Finished));

        registry.clear_finished();
        assert!(registry.finished().is_empty());
    }

    #[test]
    fn test_concurrent_joins_and_quits_do_not_interfere() {
        let registry = Arc::new(ClientRegistry::new());
        let ids: Vec<String> = (0..32).map(|i| registry.register(&format!("h{i}"))).collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, id)| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.join(&id).unwrap();
                    if i % 2 == 0 {
                        registry.quit(&id).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected: Vec<String> = {
            let mut odd: Vec<String> = ids.into_iter().skip(1).step_by(2).collect();
            odd.sort();
            odd
        };
        assert_eq!(registry.joined(), expected);
    }
}
