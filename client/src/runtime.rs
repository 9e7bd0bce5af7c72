use std::{io, path::PathBuf, sync::Arc};

use comms::{
    Deserialize, Qos, TopicPair,
    envelope::{self, Broadcast, ResultEnvelope},
    now_ms,
    pubsub::{Subscription, Transport},
};
use log::{debug, error, info, warn};
use model::{ParameterMap, training::Trainer};
use telemetry::{MetricEvent, MetricsSink, record_quietly};
use tokio::task;

use crate::{
    ClientErr, Result,
    history::{History, RoundRecord},
};

/// The phases of a client round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitingForRound,
    LocalTraining,
    LocalTesting,
    Reporting,
    Stopped,
}

/// The outcome of handling a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The result of the round was published.
    Reported { round: usize },
    /// The broadcast was out of order or repeated.
    Discarded { round: usize, expected: usize },
    /// The last round was reported and the runtime stopped.
    Finished { round: usize },
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub qos: Qos,
    /// Used when a broadcast asks for zero local epochs.
    pub fallback_epochs: usize,
    pub test_every: Option<usize>,
    pub history_dir: Option<PathBuf>,
}

/// Answers the broadcasts of the aggregator by training locally.
pub struct ClientRuntime<T: Transport> {
    client_id: String,
    topics: TopicPair,
    transport: T,
    trainer: Box<dyn Trainer>,
    config: RuntimeConfig,
    phase: Phase,
    last_seen_round: usize,
    local: Option<ParameterMap>,
    history: History,
    sink: Arc<dyn MetricsSink>,
}

impl<T: Transport> ClientRuntime<T> {
    /// Creates a new `ClientRuntime`.
    ///
    /// # Arguments
    /// * `client_id` - The id the registry assigned to this client.
    /// * `transport` - The pub/sub connection to the aggregator.
    /// * `trainer` - Trains and evaluates over the local partition.
    /// * `config` - The runtime settings.
    /// * `sink` - Where the local metrics are reported.
    pub fn new(
        client_id: String,
        transport: T,
        trainer: Box<dyn Trainer>,
        config: RuntimeConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            topics: TopicPair::for_client(&client_id),
            history: History::new(&client_id),
            client_id,
            transport,
            trainer,
            config,
            phase: Phase::WaitingForRound,
            last_seen_round: 0,
            local: None,
            sink,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_seen_round(&self) -> usize {
        self.last_seen_round
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Subscribes to the broadcasts of this client, must happen before joining.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.transport
            .subscribe(&self.topics.to_client)
            .await
            .map_err(ClientErr::TransportFailure)
    }

    /// Handles every broadcast received on `sub` until the last round.
    ///
    /// A round whose parameters don't fit the local model is abandoned and the
    /// runtime keeps waiting for the next one.
    pub async fn run(&mut self, mut sub: Subscription) -> Result<&History> {
        while let Some(delivery) = sub.recv().await {
            let broadcast = match Broadcast::deserialize(&delivery.payload[..]) {
                Ok(broadcast) => broadcast,
                Err(e) => {
                    warn!(client_id = self.client_id.as_str(); "dropping a malformed broadcast: {e}");
                    continue;
                }
            };

            match self.handle_broadcast(broadcast).await {
                Ok(Handled::Finished { .. }) => return Ok(&self.history),
                Ok(_) => {}
                Err(e @ (ClientErr::ParameterMismatch(_) | ClientErr::Model(_))) => {
                    error!(client_id = self.client_id.as_str(), round = self.last_seen_round; "round abandoned: {e}");
                    self.phase = Phase::WaitingForRound;
                }
                Err(e) => return Err(e),
            }
        }

        self.phase = Phase::Stopped;
        Err(ClientErr::TransportFailure(io::Error::new(
            io::ErrorKind::NotConnected,
            "the broadcast subscription closed before the last round",
        )))
    }

    /// Runs a round for `broadcast`.
    ///
    /// # Returns
    /// `Discarded` unless the broadcast announces the round right after the last
    /// one seen (any round for the first broadcast), a `ParameterMismatch` if its
    /// parameters don't fit the local model.
    pub async fn handle_broadcast(&mut self, broadcast: Broadcast) -> Result<Handled> {
        let round = broadcast.round.current;
        let expected = self.expected_round(round);

        if round != expected {
            warn!(client_id = self.client_id.as_str(); "discarding broadcast of round {round}, expected {expected}");
            return Ok(Handled::Discarded { round, expected });
        }

        self.last_seen_round = round;

        let comm_delay_ms = broadcast.comm_delay_ms();
        self.report(round, "comm_delay_ms", comm_delay_ms as f64);
        info!(client_id = self.client_id.as_str(), round = round, total = broadcast.round.total; "round started");

        let local = self.load(broadcast.global_model)?;

        self.phase = Phase::LocalTraining;
        let epochs = match broadcast.local_epochs {
            0 => self.config.fallback_epochs.max(1),
            n => n,
        };

        let trainer = &mut self.trainer;
        let (updated, metrics) = task::block_in_place(|| trainer.train_one_round(&local, epochs))?;
        debug!(client_id = self.client_id.as_str(), round = round, loss = metrics.loss; "local training done");

        self.report(round, "train_loss", metrics.loss as f64);
        if let Some(accuracy) = metrics.accuracy {
            self.report(round, "train_accuracy", accuracy as f64);
        }

        let (test_loss, test_accuracy) = if due(round, self.config.test_every) {
            self.test(round, &updated)
        } else {
            (None, None)
        };

        self.history.push(RoundRecord {
            round,
            train_loss: metrics.loss,
            train_accuracy: metrics.accuracy,
            test_loss,
            test_accuracy,
            samples: metrics.samples,
            comm_delay_ms,
        });

        self.phase = Phase::Reporting;
        let result = ResultEnvelope {
            round_index: round,
            client_id: self.client_id.clone(),
            parameters: updated,
            sent_time_ms: now_ms(),
        };

        let payload = envelope::to_bytes(&result)?;
        self.transport
            .publish(&self.topics.to_aggregator, payload, self.config.qos)
            .await
            .map_err(ClientErr::TransportFailure)?;

        self.local = Some(result.parameters);
        info!(client_id = self.client_id.as_str(), round = round; "result reported");

        if round >= broadcast.round.total {
            self.finish()?;
            return Ok(Handled::Finished { round });
        }

        self.phase = Phase::WaitingForRound;
        Ok(Handled::Reported { round })
    }

    /// The round a broadcast must announce to be handled.
    ///
    /// A runtime that hasn't seen any round joined mid-experiment and adopts the
    /// first round it is sent, from then on rounds must follow each other.
    fn expected_round(&self, announced: usize) -> usize {
        if self.last_seen_round == 0 && self.local.is_none() && announced > 1 {
            info!(client_id = self.client_id.as_str(); "joining the experiment at round {announced}");
            return announced;
        }

        self.last_seen_round + 1
    }

    /// Takes `global` as the local model.
    ///
    /// The first round adopts its layout, later rounds must match it.
    fn load(&mut self, global: ParameterMap) -> Result<ParameterMap> {
        if let Some(local) = &self.local {
            local.check_layout(&global)?;
        }

        self.local = Some(global.clone());
        Ok(global)
    }

    fn test(&mut self, round: usize, params: &ParameterMap) -> (Option<f32>, Option<f32>) {
        self.phase = Phase::LocalTesting;
        let trainer = &mut self.trainer;

        match task::block_in_place(|| trainer.evaluate(params)) {
            Ok(metrics) => {
                self.report(round, "test_loss", metrics.loss as f64);
                self.report(round, "test_accuracy", metrics.accuracy as f64);
                (Some(metrics.loss), Some(metrics.accuracy))
            }
            Err(e) => {
                warn!(client_id = self.client_id.as_str(), round = round; "local test failed: {e}");
                (None, None)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.phase = Phase::Stopped;

        if let Some(dir) = &self.config.history_dir {
            let path = dir.join(format!("{}.json", self.client_id));
            self.history.save(&path)?;
            info!(client_id = self.client_id.as_str(); "history written to {}", path.display());
        }

        if let Err(e) = self.sink.flush() {
            warn!("failed to flush the metrics: {e}");
        }

        info!(client_id = self.client_id.as_str(), rounds = self.last_seen_round; "training finished");
        Ok(())
    }

    fn report(&self, round: usize, name: &str, value: f64) {
        record_quietly(&*self.sink, MetricEvent::new(round, &self.client_id, name, value));
    }
}

fn due(round: usize, every: Option<usize>) -> bool {
    every.is_some_and(|n| n > 0 && round % n == 0)
}
