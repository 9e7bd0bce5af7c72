use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use comms::envelope::ResultEnvelope;
use log::{debug, warn};
use model::{ModelErr, ParameterMap};
use parking_lot::Mutex;
use telemetry::{MetricEvent, MetricsSink, record_quietly};
use tokio::{
    sync::mpsc,
    task::{self, JoinHandle},
};

use crate::{registry::ClientRegistry, sessions::Inbound};

/// The outcome of offering a result to the collector.
#[derive(Debug, PartialEq)]
pub enum Admission {
    Accepted {
        received: usize,
        expected: usize,
    },
    /// The result belongs to a round other than the one being collected.
    WrongRound {
        got: usize,
        current: usize,
    },
    /// The client was not part of the round snapshot.
    NotParticipant,
    Duplicate,
    /// The parameters do not match the layout of the global model.
    Rejected(ModelErr),
    /// No round is collecting results.
    Idle,
}

/// When a result arrived, kept per contributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub sent_time_ms: u64,
    pub comm_delay_ms: u64,
}

struct RoundBuffer {
    round: usize,
    participants: BTreeSet<String>,
    received: BTreeMap<String, Receipt>,
    sum: ParameterMap,
}

/// Everything collected for a round, handed over to the reduction.
#[derive(Debug)]
pub struct RoundResults {
    pub round: usize,
    pub sum: ParameterMap,
    pub received: BTreeMap<String, Receipt>,
    pub missing: Vec<String>,
}

impl RoundResults {
    /// Returns the elementwise mean of the received parameters.
    pub fn mean(self) -> model::Result<ParameterMap> {
        if self.received.is_empty() {
            return Err(ModelErr::EmptyReduction);
        }

        let mut mean = self.sum;
        mean.scale(1.0 / self.received.len() as f32);
        Ok(mean)
    }
}

/// Collects the results of the round in progress.
///
/// A single lock guards both the received set and the running sum. Admitting a
/// result adds its parameters to the sum while holding it, so the reduction never
/// sees a result that was counted but not yet summed.
#[derive(Default)]
pub struct ResultCollector {
    round: Mutex<Option<RoundBuffer>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting `round`, dropping anything left from a previous one.
    ///
    /// # Arguments
    /// * `round` - The one based index announced in the broadcast.
    /// * `participants` - The clients expected to answer.
    /// * `template` - The global model, results must share its layout.
    pub fn open_round(&self, round: usize, participants: &[String], template: &ParameterMap) {
        let buffer = RoundBuffer {
            round,
            participants: participants.iter().cloned().collect(),
            received: BTreeMap::new(),
            sum: template.zeros_like(),
        };

        *self.round.lock() = Some(buffer);
    }

    /// Offers `envelope` to the round being collected.
    pub fn admit(&self, envelope: &ResultEnvelope) -> Admission {
        self.admit_with(envelope, |_| {})
    }

    /// Offers `envelope` and runs `on_accepted` with its client id before the
    /// result is visible in the received count.
    pub fn admit_with<F>(&self, envelope: &ResultEnvelope, on_accepted: F) -> Admission
    where
        F: FnOnce(&str),
    {
        let mut guard = self.round.lock();
        let Some(buffer) = guard.as_mut() else {
            return Admission::Idle;
        };

        if envelope.round_index != buffer.round {
            return Admission::WrongRound {
                got: envelope.round_index,
                current: buffer.round,
            };
        }

        if !buffer.participants.contains(&envelope.client_id) {
            return Admission::NotParticipant;
        }

        if buffer.received.contains_key(&envelope.client_id) {
            return Admission::Duplicate;
        }

        if let Err(e) = buffer.sum.accumulate(&envelope.parameters) {
            return Admission::Rejected(e);
        }

        let receipt = Receipt {
            sent_time_ms: envelope.sent_time_ms,
            comm_delay_ms: envelope.comm_delay_ms(),
        };
        on_accepted(&envelope.client_id);
        buffer.received.insert(envelope.client_id.clone(), receipt);

        Admission::Accepted {
            received: buffer.received.len(),
            expected: buffer.participants.len(),
        }
    }

    /// Returns how many results the current round has received.
    pub fn received(&self) -> usize {
        self.round
            .lock()
            .as_ref()
            .map(|b| b.received.len())
            .unwrap_or_default()
    }

    /// Returns the participants that did not answer yet.
    pub fn missing(&self) -> Vec<String> {
        match self.round.lock().as_ref() {
            Some(b) => missing(b),
            None => Vec::new(),
        }
    }

    /// Hands over everything collected and stops collecting.
    pub fn take(&self) -> Option<RoundResults> {
        let buffer = self.round.lock().take()?;
        let missing = missing(&buffer);

        Some(RoundResults {
            round: buffer.round,
            sum: buffer.sum,
            received: buffer.received,
            missing,
        })
    }
}

fn missing(buffer: &RoundBuffer) -> Vec<String> {
    buffer
        .participants
        .iter()
        .filter(|id| !buffer.received.contains_key(*id))
        .cloned()
        .collect()
}

/// Spawns the task draining the inbound results into `collector`.
///
/// The summation runs in a blocking section, so this needs the multi threaded
/// runtime. Accepted clients are marked finished in the registry while the
/// results lock is held, the results lock is taken before the registry locks.
pub fn spawn_collector(
    collector: Arc<ResultCollector>,
    registry: Arc<ClientRegistry>,
    mut inbox: mpsc::Receiver<Inbound>,
    sink: Arc<dyn MetricsSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Inbound {
            client_id,
            envelope,
        }) = inbox.recv().await
        {
            let round = envelope.round_index;
            let admission = task::block_in_place(|| {
                collector.admit_with(&envelope, |id| registry.record_finished(id))
            });

            match admission {
                Admission::Accepted { received, expected } => {
                    let delay = envelope.comm_delay_ms() as f64;
                    record_quietly(&*sink, MetricEvent::new(round, &client_id, "comm_delay_ms", delay));
                    debug!(client_id = client_id.as_str(), round = round; "result {received}/{expected} accepted");
                }
                Admission::WrongRound { got, current } => {
                    warn!(client_id = client_id.as_str(); "discarding a result for round {got}, collecting round {current}");
                }
                Admission::NotParticipant => {
                    warn!(client_id = client_id.as_str(), round = round; "discarding a result from a client outside the round");
                }
                Admission::Duplicate => {
                    warn!(client_id = client_id.as_str(), round = round; "discarding a duplicated result");
                }
                Admission::Rejected(e) => {
                    warn!(client_id = client_id.as_str(), round = round; "discarding a result: {e}");
                }
                Admission::Idle => {
                    debug!(client_id = client_id.as_str(); "no round in progress, result dropped");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use comms::now_ms;
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn params(value: f32) -> ParameterMap {
        let mut map = ParameterMap::new();
        map.insert("w", ArrayD::from_elem(IxDyn(&[2, 2]), value));
        map.insert("b", ArrayD::from_elem(IxDyn(&[2]), value));
        map
    }

    fn result(round: usize, client_id: &str, value: f32) -> ResultEnvelope {
        ResultEnvelope {
            round_index: round,
            client_id: client_id.to_string(),
            parameters: params(value),
            sent_time_ms: now_ms(),
        }
    }

    fn participants(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_accepted_results_are_summed() {
        let collector = ResultCollector::new();
        collector.open_round(1, &participants(&["a", "b"]), &params(0.0));

        assert_eq!(
            collector.admit(&result(1, "a", 1.0)),
            Admission::Accepted { received: 1, expected: 2 }
        );
        assert_eq!(collector.missing(), vec!["b".to_string()]);
        assert_eq!(
            collector.admit(&result(1, "b", 3.0)),
            Admission::Accepted { received: 2, expected: 2 }
        );

        let results = collector.take().unwrap();
        assert!(results.missing.is_empty());
        assert_eq!(results.mean().unwrap(), params(2.0));
        assert_eq!(collector.received(), 0);
    }

    #[test]
    fn test_other_rounds_never_reach_the_sum() {
        let collector = ResultCollector::new();
        collector.open_round(1, &participants(&["a"]), &params(0.0));

        assert_eq!(
            collector.admit(&result(2, "a", 9.0)),
            Admission::WrongRound { got: 2, current: 1 }
        );
        assert_eq!(
            collector.admit(&result(0, "a", 9.0)),
            Admission::WrongRound { got: 0, current: 1 }
        );
        assert_eq!(collector.received(), 0);

        collector.admit(&result(1, "a", 1.0));
        assert_eq!(collector.take().unwrap().mean().unwrap(), params(1.0));
    }

    #[test]
    fn test_duplicates_and_strangers_are_not_counted() {
        let collector = ResultCollector::new();
        collector.open_round(3, &participants(&["a", "b"]), &params(0.0));

        collector.admit(&result(3, "a", 1.0));
        assert_eq!(collector.admit(&result(3, "a", 5.0)), Admission::Duplicate);
        assert_eq!(collector.admit(&result(3, "z", 5.0)), Admission::NotParticipant);
        assert_eq!(collector.received(), 1);
    }

    #[test]
    fn test_mismatched_layout_is_rejected() {
        let collector = ResultCollector::new();
        collector.open_round(1, &participants(&["a"]), &params(0.0));

        let mut bad = result(1, "a", 1.0);
        bad.parameters.insert("extra", ArrayD::zeros(IxDyn(&[1])));

        assert!(matches!(
            collector.admit(&bad),
            Admission::Rejected(ModelErr::ParameterMismatch { .. })
        ));
        assert_eq!(collector.received(), 0);
    }

    #[test]
    fn test_idle_collector_drops_results() {
        let collector = ResultCollector::new();
        assert_eq!(collector.admit(&result(1, "a", 1.0)), Admission::Idle);
        assert!(collector.take().is_none());
    }

    #[test]
    fn test_empty_round_has_no_mean() {
        let collector = ResultCollector::new();
        collector.open_round(1, &participants(&["a"]), &params(0.0));

        let results = collector.take().unwrap();
        assert_eq!(results.missing, vec!["a".to_string()]);
        assert_eq!(results.mean().unwrap_err(), ModelErr::EmptyReduction);
    }

    #[test]
    fn test_accepted_clients_are_finished_before_they_are_counted() {
        let registry = ClientRegistry::new();
        let id = registry.register("a");
        registry.join(&id).unwrap();

        let collector = ResultCollector::new();
        collector.open_round(1, std::slice::from_ref(&id), &params(0.0));

        let record = |client_id: &str| registry.record_finished(client_id);
        assert_eq!(
            collector.admit_with(&result(2, &id, 1.0), record),
            Admission::WrongRound { got: 2, current: 1 }
        );
        assert!(registry.finished().is_empty());

        assert_eq!(
            collector.admit_with(&result(1, &id, 1.0), record),
            Admission::Accepted { received: 1, expected: 1 }
        );
        assert_eq!(registry.finished(), vec![id]);
    }
}
