use std::{sync::Arc, time::Duration};

use aggregator::{
    AggregatorErr,
    collector::{self, ResultCollector},
    config::{DeadlinePolicy, RoundDeadline},
    coordinator::{CoordinatorConfig, Phase, RoundCoordinator, TrainingSummary},
    export::ModelExporter,
    registry::ClientRegistry,
    sessions::SessionManager,
};
use comms::{
    Deserialize, Qos, TopicPair,
    envelope::{self, Broadcast, ResultEnvelope},
    now_ms,
    pubsub::{MemoryBroker, MemoryTransport, Subscription, Transport},
};
use model::{
    ParameterMap,
    training::{EvalMetrics, TrainMetrics, Trainer},
};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use telemetry::MemorySink;
use tokio::{sync::mpsc, task::JoinHandle, time};

const TIMEOUT: Duration = Duration::from_secs(10);

fn params(value: f32) -> ParameterMap {
    let mut map = ParameterMap::new();
    map.insert("layer0.weight", ArrayD::from_elem(IxDyn(&[2, 3]), value));
    map.insert("layer0.bias", ArrayD::from_elem(IxDyn(&[2]), value));
    map
}

fn config(total_rounds: usize, expected_clients: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        total_rounds,
        expected_clients,
        local_epochs: 1,
        device: "cpu".to_string(),
        qos: Qos::ExactlyOnce,
        poll_interval: Duration::from_millis(5),
        round_deadline: None,
        evaluate_every: None,
        checkpoint_every: None,
    }
}

struct Harness {
    broker: MemoryBroker,
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager<MemoryTransport>>,
    results: Arc<ResultCollector>,
    sink: Arc<MemorySink>,
    _collector: JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        let broker = MemoryBroker::new(64);
        let (tx, rx) = mpsc::channel(64);

        let registry = Arc::new(ClientRegistry::new());
        let sessions = Arc::new(SessionManager::new(broker.connect(), tx));
        let results = Arc::new(ResultCollector::new());
        let sink = Arc::new(MemorySink::new());

        let collector =
            collector::spawn_collector(results.clone(), registry.clone(), rx, sink.clone());

        Self {
            broker,
            registry,
            sessions,
            results,
            sink,
            _collector: collector,
        }
    }

    fn coordinator(&self, config: CoordinatorConfig) -> RoundCoordinator<MemoryTransport> {
        RoundCoordinator::new(
            config,
            self.registry.clone(),
            self.sessions.clone(),
            self.results.clone(),
            params(0.0),
            self.sink.clone(),
        )
    }

    /// Registers a client and subscribes it to its broadcasts, without joining.
    async fn register(&self, host_id: &str) -> (String, Subscription) {
        let client_id = self.registry.register(host_id);
        let topic = TopicPair::for_client(&client_id).to_client;
        let sub = self.broker.connect().subscribe(&topic).await.unwrap();
        (client_id, sub)
    }

    async fn join(&self, host_id: &str) -> (String, Subscription) {
        let (client_id, sub) = self.register(host_id).await;
        self.registry.join(&client_id).unwrap();
        self.sessions.open_session(&client_id).await.unwrap();
        (client_id, sub)
    }

    /// Spawns a client answering every broadcast with `answer(round)` until the
    /// last round, it returns the rounds it saw and its subscription.
    fn spawn_client<F>(
        &self,
        client_id: String,
        mut sub: Subscription,
        answer: F,
    ) -> JoinHandle<(Vec<usize>, Subscription)>
    where
        F: Fn(usize) -> Vec<ResultEnvelope> + Send + 'static,
    {
        let conn = self.broker.connect();
        let topic = TopicPair::for_client(&client_id).to_aggregator;

        tokio::spawn(async move {
            let mut rounds = Vec::new();

            while let Some(delivery) = sub.recv().await {
                let broadcast = Broadcast::deserialize(&delivery.payload[..]).unwrap();
                rounds.push(broadcast.round.current);

                for result in answer(broadcast.round.current) {
                    let bytes = envelope::to_bytes(&result).unwrap();
                    conn.publish(&topic, bytes, Qos::ExactlyOnce).await.unwrap();
                }

                if broadcast.round.current == broadcast.round.total {
                    break;
                }
            }

            (rounds, sub)
        })
    }
}

fn result(round: usize, client_id: &str, value: f32) -> ResultEnvelope {
    ResultEnvelope {
        round_index: round,
        client_id: client_id.to_string(),
        parameters: params(value),
        sent_time_ms: now_ms(),
    }
}

async fn run(coordinator: &mut RoundCoordinator<MemoryTransport>) -> aggregator::Result<TrainingSummary> {
    time::timeout(TIMEOUT, coordinator.run())
        .await
        .expect("the coordinator stalled")
}

/// The collector reports after admitting, so its side effects may trail the round.
async fn eventually<F: Fn() -> bool>(cond: F) {
    let wait = async {
        while !cond() {
            time::sleep(Duration::from_millis(5)).await;
        }
    };

    time::timeout(TIMEOUT, wait).await.expect("the condition never held");
}

#[derive(Clone, Default)]
struct MemoryExporter {
    checkpoints: Arc<Mutex<Vec<(usize, ParameterMap)>>>,
    last: Arc<Mutex<Option<ParameterMap>>>,
}

impl ModelExporter for MemoryExporter {
    fn checkpoint(&mut self, round: usize, params: &ParameterMap) -> aggregator::Result<()> {
        self.checkpoints.lock().push((round, params.clone()));
        Ok(())
    }

    fn export_final(&mut self, params: &ParameterMap) -> aggregator::Result<()> {
        *self.last.lock() = Some(params.clone());
        Ok(())
    }
}

/// Scores a model by the first value of its bias.
struct BiasProbe;

impl Trainer for BiasProbe {
    fn train_one_round(&mut self, params: &ParameterMap, _epochs: usize) -> model::Result<(ParameterMap, TrainMetrics)> {
        let metrics = TrainMetrics {
            loss: 0.0,
            accuracy: None,
            samples: 0,
        };
        Ok((params.clone(), metrics))
    }

    fn evaluate(&mut self, params: &ParameterMap) -> model::Result<EvalMetrics> {
        let bias = params
            .get("layer0.bias")
            .and_then(|t| t.iter().next().copied())
            .unwrap_or_default();
        Ok(EvalMetrics {
            accuracy: bias,
            loss: -bias,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_clients_produce_the_elementwise_mean() {
    let h = Harness::new();
    let mut clients = Vec::new();

    for (host, value) in [("a", 1.0), ("b", 2.0), ("c", 6.0)] {
        let (id, sub) = h.join(host).await;
        let answer_id = id.clone();
        clients.push(h.spawn_client(id, sub, move |round| vec![result(round, &answer_id, value)]));
    }

    let exporter = MemoryExporter::default();
    let mut coordinator = h.coordinator(config(1, 3)).with_exporter(Box::new(exporter.clone()));
    let status = coordinator.status();

    let summary = run(&mut coordinator).await.unwrap();

    assert_eq!(coordinator.current_round(), 1);
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.model, params(3.0));
    assert_eq!(exporter.last.lock().clone(), Some(params(3.0)));
    assert_eq!(status.borrow().phase, Phase::Finished);

    let report = &summary.history[0];
    assert_eq!((report.round, report.participants, report.contributors), (1, 3, 3));
    assert_eq!(h.registry.finished().len(), 3);
    eventually(|| h.sink.values("comm_delay_ms").len() == 3).await;

    for client in clients {
        let (rounds, _) = client.await.unwrap();
        assert_eq!(rounds, vec![1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unjoined_clients_are_ignored() {
    let h = Harness::new();
    let mut clients = Vec::new();

    for host in ["a", "b", "c"] {
        let (id, sub) = h.join(host).await;
        let answer_id = id.clone();
        clients.push(h.spawn_client(id, sub, move |round| vec![result(round, &answer_id, 3.0)]));
    }

    let (_idle, mut idle_sub) = h.register("d").await;

    let mut coordinator = h.coordinator(config(1, 3));
    let summary = run(&mut coordinator).await.unwrap();

    assert_eq!(summary.history[0].participants, 3);
    assert_eq!(summary.model, params(3.0));
    assert!(time::timeout(Duration::from_millis(50), idle_sub.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn early_results_never_reach_the_current_round() {
    let h = Harness::new();

    let (a, a_sub) = h.join("a").await;
    let (b, b_sub) = h.join("b").await;

    let a_id = a.clone();
    let eager = h.spawn_client(a, a_sub, move |round| {
        vec![
            result(round + 1, &a_id, 100.0),
            result(round, &a_id, round as f32 * 10.0 + 1.0),
        ]
    });

    let b_id = b.clone();
    let plain = h.spawn_client(b, b_sub, move |round| {
        vec![result(round, &b_id, round as f32 * 10.0 + 3.0)]
    });

    let mut config = config(2, 2);
    config.checkpoint_every = Some(1);

    let exporter = MemoryExporter::default();
    let mut coordinator = h.coordinator(config).with_exporter(Box::new(exporter.clone()));
    let summary = run(&mut coordinator).await.unwrap();

    assert_eq!(
        exporter.checkpoints.lock().clone(),
        vec![(1, params(12.0)), (2, params(22.0))]
    );
    assert_eq!(summary.model, params(22.0));

    assert_eq!(eager.await.unwrap().0, vec![1, 2]);
    assert_eq!(plain.await.unwrap().0, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_round_finishes_without_another_broadcast() {
    let h = Harness::new();
    let (id, sub) = h.join("a").await;
    let answer_id = id.clone();
    let client = h.spawn_client(id, sub, move |round| vec![result(round, &answer_id, 5.0)]);

    let mut coordinator = h
        .coordinator(config(1, 1))
        .with_exporter(Box::new(MemoryExporter::default()))
        .with_evaluator(Box::new(BiasProbe));
    let driver = tokio::spawn(async move { run(&mut coordinator).await });

    let summary = driver.await.unwrap().unwrap();
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.history.len(), 1);

    let (rounds, mut sub) = client.await.unwrap();
    assert_eq!(rounds, vec![1]);
    assert!(time::timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    assert!(h.sessions.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_excludes_missing_clients() {
    let h = Harness::new();
    let (a, a_sub) = h.join("a").await;
    let (_silent, _silent_sub) = h.join("b").await;

    let a_id = a.clone();
    let _client = h.spawn_client(a, a_sub, move |round| vec![result(round, &a_id, 4.0)]);

    let mut config = config(1, 2);
    config.round_deadline = Some(RoundDeadline {
        after_ms: 100,
        policy: DeadlinePolicy::ExcludeMissing,
    });

    let mut coordinator = h.coordinator(config);
    let summary = run(&mut coordinator).await.unwrap();

    assert_eq!(summary.model, params(4.0));
    assert_eq!(summary.history[0].participants, 2);
    assert_eq!(summary.history[0].contributors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_can_abort_the_round() {
    let h = Harness::new();
    let (silent, _silent_sub) = h.join("a").await;

    let mut config = config(3, 1);
    config.round_deadline = Some(RoundDeadline {
        after_ms: 50,
        policy: DeadlinePolicy::Abort,
    });

    let mut coordinator = h.coordinator(config);
    let err = run(&mut coordinator).await.unwrap_err();

    match err {
        AggregatorErr::RoundAborted { round, missing } => {
            assert_eq!(round, 1);
            assert_eq!(missing, vec![silent]);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(coordinator.current_round(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starting_without_clients_fails() {
    let h = Harness::new();

    let mut coordinator = h.coordinator(config(1, 0));
    let err = run(&mut coordinator).await.unwrap_err();

    assert!(matches!(err, AggregatorErr::NoClients));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_model_is_evaluated_every_n_rounds() {
    let h = Harness::new();
    let (id, sub) = h.join("a").await;
    let answer_id = id.clone();
    let _client = h.spawn_client(id, sub, move |round| vec![result(round, &answer_id, round as f32)]);

    let mut config = config(4, 1);
    config.evaluate_every = Some(2);

    let mut coordinator = h.coordinator(config).with_evaluator(Box::new(BiasProbe));
    let summary = run(&mut coordinator).await.unwrap();

    let evaluated: Vec<Option<f32>> = summary
        .history
        .iter()
        .map(|r| r.evaluation.map(|m| m.accuracy))
        .collect();
    assert_eq!(evaluated, vec![None, Some(2.0), None, Some(4.0)]);
    assert_eq!(h.sink.values("accuracy"), vec![2.0, 4.0]);
    assert_eq!(h.sink.values("contributors"), vec![1.0; 4]);
}
