use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use comms::{
    Qos,
    envelope::{self, Broadcast, RoundInfo, SysHints},
    now_ms,
    pubsub::Transport,
};
use futures::future;
use log::{debug, info, warn};
use model::{
    ModelErr, ParameterMap,
    training::{EvalMetrics, Trainer},
};
use telemetry::{MetricEvent, MetricsSink, record_quietly};
use tokio::{sync::watch, task, time};

use crate::{
    AggregatorErr, Result,
    collector::ResultCollector,
    config::{AggregatorConfig, DeadlinePolicy, RoundDeadline},
    export::{ModelExporter, NoopExporter},
    registry::ClientRegistry,
    sessions::SessionManager,
};

const SOURCE: &str = "aggregator";

/// The phases of the round state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Broadcasting,
    AwaitingResults,
    Reducing,
    Finished,
}

/// The completed rounds and the phase the coordinator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub round: usize,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub total_rounds: usize,
    /// How many clients must have joined before the first round starts.
    pub expected_clients: usize,
    pub local_epochs: usize,
    pub device: String,
    pub qos: Qos,
    pub poll_interval: Duration,
    pub round_deadline: Option<RoundDeadline>,
    pub evaluate_every: Option<usize>,
    pub checkpoint_every: Option<usize>,
}

impl From<&AggregatorConfig> for CoordinatorConfig {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            total_rounds: config.total_rounds,
            expected_clients: config.expected_clients(),
            local_epochs: config.local_epochs,
            device: config.device.clone(),
            qos: config.qos,
            poll_interval: config.poll_interval(),
            round_deadline: config.round_deadline,
            evaluate_every: config.evaluate_every,
            checkpoint_every: config.checkpoint_every,
        }
    }
}

/// What happened in a single round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub round: usize,
    pub participants: usize,
    pub contributors: usize,
    pub duration: Duration,
    pub evaluation: Option<EvalMetrics>,
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub rounds: usize,
    pub model: ParameterMap,
    pub history: Vec<RoundReport>,
}

/// Drives the rounds of the experiment.
///
/// The coordinator is the only writer of the global model. Every round it
/// broadcasts a copy of it to the joined clients, waits until each of them
/// answered and replaces it with the mean of their results.
pub struct RoundCoordinator<T: Transport> {
    config: CoordinatorConfig,
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager<T>>,
    collector: Arc<ResultCollector>,
    global: ParameterMap,
    current_round: usize,
    status: watch::Sender<Status>,
    exporter: Box<dyn ModelExporter>,
    evaluator: Option<Box<dyn Trainer>>,
    sink: Arc<dyn MetricsSink>,
}

impl<T: Transport> RoundCoordinator<T> {
    /// Creates a new `RoundCoordinator`.
    ///
    /// # Arguments
    /// * `config` - The round settings.
    /// * `registry` - The registry the participants are taken from.
    /// * `sessions` - The sessions broadcasts are published through.
    /// * `collector` - Where the results of the clients are gathered.
    /// * `initial` - The freshly built global model.
    /// * `sink` - Where the round metrics are reported.
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ClientRegistry>,
        sessions: Arc<SessionManager<T>>,
        collector: Arc<ResultCollector>,
        initial: ParameterMap,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let (status, _) = watch::channel(Status {
            round: 0,
            phase: Phase::Idle,
        });

        Self {
            config,
            registry,
            sessions,
            collector,
            global: initial,
            current_round: 0,
            status,
            exporter: Box::new(NoopExporter),
            evaluator: None,
            sink,
        }
    }

    pub fn with_exporter(mut self, exporter: Box<dyn ModelExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Installs the trainer the global model is evaluated with.
    pub fn with_evaluator(mut self, evaluator: Box<dyn Trainer>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Returns a receiver that observes every phase change.
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn current_round(&self) -> usize {
        self.current_round
    }

    pub fn global(&self) -> &ParameterMap {
        &self.global
    }

    /// Runs every round of the experiment.
    ///
    /// # Returns
    /// The final global model and the report of every round, `NoClients` if every
    /// client left between rounds or `RoundAborted` if a deadline configured to
    /// abort was missed.
    pub async fn run(&mut self) -> Result<TrainingSummary> {
        self.wait_for_clients().await;

        let mut history = Vec::with_capacity(self.config.total_rounds);

        while self.current_round < self.config.total_rounds {
            let started = Instant::now();

            let participants = self.broadcast().await?;
            self.await_results(participants.len()).await?;

            let report = self.reduce(participants.len(), started)?;
            history.push(report);
        }

        self.finish(history).await
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_replace(Status {
            round: self.current_round,
            phase,
        });
    }

    /// Joined clients with an open session, sorted by id.
    fn participants(&self) -> Vec<String> {
        self.registry
            .joined()
            .into_iter()
            .filter(|id| self.sessions.contains(id))
            .collect()
    }

    async fn wait_for_clients(&self) {
        let expected = self.config.expected_clients;
        info!("waiting for {expected} clients to join");

        loop {
            let ready = self.participants().len();
            if ready >= expected {
                info!("{ready} clients joined, starting");
                return;
            }

            debug!("{ready}/{expected} clients joined");
            time::sleep(self.config.poll_interval).await;
        }
    }

    async fn broadcast(&mut self) -> Result<Vec<String>> {
        self.set_phase(Phase::Broadcasting);

        let participants = self.participants();
        if participants.is_empty() {
            return Err(AggregatorErr::NoClients);
        }

        let round = self.current_round + 1;
        self.registry.clear_finished();
        self.registry.mark_training(&participants);
        self.collector.open_round(round, &participants, &self.global);

        let broadcast = Broadcast {
            round: RoundInfo {
                current: round,
                total: self.config.total_rounds,
            },
            global_model: self.global.clone(),
            sys: SysHints {
                device: self.config.device.clone(),
            },
            local_epochs: self.config.local_epochs,
            sent_time_ms: now_ms(),
        };
        let payload = envelope::to_bytes(&broadcast)?;

        info!(round = round, participants = participants.len(); "broadcasting the global model");

        let qos = self.config.qos;
        let sessions = &self.sessions;
        let sends = participants
            .iter()
            .map(|id| sessions.publish_to(id, payload.clone(), qos));

        future::try_join_all(sends).await?;
        Ok(participants)
    }

    async fn await_results(&self, expected: usize) -> Result<()> {
        self.set_phase(Phase::AwaitingResults);
        let started = Instant::now();

        loop {
            let received = self.collector.received();
            if received == expected {
                return Ok(());
            }

            if let Some(deadline) = self.config.round_deadline {
                if started.elapsed() >= deadline.after() {
                    return self.deadline_missed(deadline.policy, received);
                }
            }

            time::sleep(self.config.poll_interval).await;
        }
    }

    fn deadline_missed(&self, policy: DeadlinePolicy, received: usize) -> Result<()> {
        let round = self.current_round + 1;
        let missing = self.collector.missing();

        if policy == DeadlinePolicy::ExcludeMissing && received > 0 {
            warn!(round = round; "deadline missed, reducing without {missing:?}");
            return Ok(());
        }

        Err(AggregatorErr::RoundAborted { round, missing })
    }

    fn reduce(&mut self, participants: usize, started: Instant) -> Result<RoundReport> {
        self.set_phase(Phase::Reducing);

        let results = self
            .collector
            .take()
            .ok_or(AggregatorErr::Model(ModelErr::EmptyReduction))?;
        let round = results.round;
        let contributors = results.received.len();

        self.global = task::block_in_place(|| results.mean())?;
        self.current_round += 1;

        let duration = started.elapsed();
        info!(round = round, contributors = contributors; "global model reduced in {duration:?}");

        self.report(round, "round_duration_ms", duration.as_millis() as f64);
        self.report(round, "contributors", contributors as f64);

        let evaluation = if due(self.current_round, self.config.evaluate_every) {
            self.evaluate(round)
        } else {
            None
        };

        if due(self.current_round, self.config.checkpoint_every) {
            self.exporter.checkpoint(round, &self.global)?;
        }

        Ok(RoundReport {
            round,
            participants,
            contributors,
            duration,
            evaluation,
        })
    }

    fn evaluate(&mut self, round: usize) -> Option<EvalMetrics> {
        let evaluator = self.evaluator.as_mut()?;
        let global = &self.global;

        match task::block_in_place(|| evaluator.evaluate(global)) {
            Ok(metrics) => {
                info!(round = round, accuracy = metrics.accuracy, loss = metrics.loss; "global model evaluated");
                self.report(round, "accuracy", metrics.accuracy as f64);
                self.report(round, "loss", metrics.loss as f64);
                Some(metrics)
            }
            Err(e) => {
                warn!(round = round; "global evaluation failed: {e}");
                None
            }
        }
    }

    fn report(&self, round: usize, name: &str, value: f64) {
        record_quietly(&*self.sink, MetricEvent::new(round, SOURCE, name, value));
    }

    async fn finish(&mut self, history: Vec<RoundReport>) -> Result<TrainingSummary> {
        self.set_phase(Phase::Finished);
        info!("finished after {} rounds", self.current_round);

        self.exporter.export_final(&self.global)?;
        if let Err(e) = self.sink.flush() {
            warn!("failed to flush the metrics: {e}");
        }

        self.sessions.close_all().await;

        Ok(TrainingSummary {
            rounds: self.current_round,
            model: self.global.clone(),
            history,
        })
    }
}

fn due(completed: usize, every: Option<usize>) -> bool {
    every.is_some_and(|n| n > 0 && completed % n == 0)
}
