use std::{env, io, path::PathBuf, sync::Arc};

use client::{
    config::ClientConfig,
    registration::RegistrationClient,
    runtime::ClientRuntime,
};
use comms::pubsub::{RemoteConfig, RemoteTransport};
use log::{info, warn};
use model::training::LinearTrainer;
use telemetry::{JsonLinesSink, LogSink, MetricsSink};
use tokio::signal;

const CONFIG_VAR: &str = "FEDROUND_CONFIG";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os(CONFIG_VAR).map(PathBuf::from));
    let config = ClientConfig::load(path.as_deref())?;

    let sink: Arc<dyn MetricsSink> = match &config.metrics_path {
        Some(path) => Arc::new(JsonLinesSink::open(path).map_err(io::Error::other)?),
        None => Arc::new(LogSink),
    };

    let Some(dataset) = &config.dataset else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "a dataset is required"));
    };
    let (train, test) = dataset.load()?;
    info!("loaded {} training and {} test samples", train.len(), test.len());

    let trainer = LinearTrainer::new(
        train,
        test,
        config.learning_rate,
        config.batch_size,
        config.seed,
    );

    let mut registry = RegistrationClient::connect(&config.registry_addr, &config.retry).await?;
    let client_id = registry.register(&config.host_id).await?;

    let transport = config
        .retry
        .retry("connecting to the broker", || {
            RemoteTransport::connect(config.broker_addr.as_str(), RemoteConfig::default())
        })
        .await?;

    let mut runtime = ClientRuntime::new(
        client_id.clone(),
        transport.clone(),
        Box::new(trainer),
        config.runtime(),
        sink,
    );

    let sub = runtime.subscribe().await?;
    registry.join(&client_id).await?;
    info!(client_id = client_id.as_str(); "joined, waiting for the first round");

    let res = tokio::select! {
        res = runtime.run(sub) => res.map(|history| Some(history.rounds.len())),
        _ = signal::ctrl_c() => {
            warn!("interrupted, leaving the experiment");
            Ok(None)
        }
    };

    if let Err(e) = registry.quit(&client_id).await {
        warn!(client_id = client_id.as_str(); "failed to quit: {e}");
    }
    registry.close().await?;
    transport.close().await?;

    let rounds = res?.unwrap_or_else(|| runtime.last_seen_round());
    info!(client_id = client_id.as_str(); "done after {rounds} rounds");
    Ok(())
}
