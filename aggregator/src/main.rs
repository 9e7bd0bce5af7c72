use std::{env, io, path::PathBuf, sync::Arc};

use aggregator::{
    AggregatorErr,
    collector::{self, ResultCollector},
    config::{AggregatorConfig, BrokerConfig},
    coordinator::RoundCoordinator,
    endpoint::RegistrationServer,
    export::{JsonExporter, ModelExporter, NoopExporter},
    registry::ClientRegistry,
    sessions::SessionManager,
};
use comms::pubsub::{BrokerServer, RemoteConfig, RemoteTransport, Transport};
use log::{error, info, warn};
use model::{
    factory::{DenseFactory, ModelFactory},
    training::LinearTrainer,
};
use telemetry::{JsonLinesSink, LogSink, MetricsSink};
use tokio::{net::TcpListener, signal, sync::mpsc};

const CONFIG_VAR: &str = "FEDROUND_CONFIG";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os(CONFIG_VAR).map(PathBuf::from));
    let config = AggregatorConfig::load(path.as_deref())?;

    match config.broker.clone() {
        BrokerConfig::Embedded { listen } => {
            let listener = TcpListener::bind(&listen).await?;
            let addr = listener.local_addr()?;
            info!("embedded broker listening at {addr}");

            let mut broker = BrokerServer::new(config.inbox_capacity);
            let broker_task = tokio::spawn(async move { broker.run(listener).await });

            let transport = RemoteTransport::connect(addr, RemoteConfig::default()).await?;
            let res = run(config, transport).await;
            broker_task.abort();
            res
        }
        BrokerConfig::Remote { addr } => {
            let transport = RemoteTransport::connect(&addr, RemoteConfig::default()).await?;
            info!("connected to the broker at {addr}");
            run(config, transport).await
        }
    }
}

async fn run<T: Transport>(config: AggregatorConfig, transport: T) -> io::Result<()> {
    let sink: Arc<dyn MetricsSink> = match &config.metrics_path {
        Some(path) => Arc::new(JsonLinesSink::open(path).map_err(io::Error::other)?),
        None => Arc::new(LogSink),
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbox_capacity);
    let registry = Arc::new(ClientRegistry::new());
    let sessions = Arc::new(SessionManager::new(transport, inbound_tx));
    let results = Arc::new(ResultCollector::new());

    let collector_task =
        collector::spawn_collector(results.clone(), registry.clone(), inbound_rx, sink.clone());

    let listener = TcpListener::bind(&config.registry_listen).await?;
    info!("registration endpoint listening at {}", listener.local_addr()?);

    let mut endpoint = RegistrationServer::new(registry.clone(), sessions.clone());
    let endpoint_task = tokio::spawn(async move { endpoint.run(listener).await });

    let initial = DenseFactory::seeded(config.seed)
        .build_model(&config.model)
        .map_err(AggregatorErr::from)?;

    let exporter: Box<dyn ModelExporter> = match &config.export_dir {
        Some(dir) => Box::new(JsonExporter::new(dir)?),
        None => Box::new(NoopExporter),
    };

    let mut coordinator = RoundCoordinator::new(
        (&config).into(),
        registry,
        sessions,
        results,
        initial,
        sink,
    )
    .with_exporter(exporter);

    if let Some(source) = &config.evaluation {
        let test = source.load().map_err(AggregatorErr::from)?;
        coordinator = coordinator.with_evaluator(Box::new(LinearTrainer::evaluator(test)));
    }

    tokio::select! {
        res = coordinator.run() => match res {
            Ok(summary) => info!("training finished after {} rounds", summary.rounds),
            Err(e) => {
                error!("training failed: {e}");
                endpoint_task.abort();
                collector_task.abort();
                return Err(e.into());
            }
        },
        _ = signal::ctrl_c() => warn!("interrupted, stopping"),
    }

    endpoint_task.abort();
    collector_task.abort();
    Ok(())
}
