use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use comms::Qos;
use model::{
    dataset::DatasetSource,
    factory::{LayerSpec, ModelSpec},
};
use serde::Deserialize;

use crate::{AggregatorErr, Result};

/// What the coordinator does with the clients that miss the round deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Reduce over the results that did arrive.
    ExcludeMissing,
    /// Stop the experiment.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RoundDeadline {
    pub after_ms: u64,
    pub policy: DeadlinePolicy,
}

impl RoundDeadline {
    pub fn after(&self) -> Duration {
        Duration::from_millis(self.after_ms)
    }
}

/// Where the pub/sub broker lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerConfig {
    /// The aggregator serves the broker itself.
    Embedded { listen: String },
    Remote { addr: String },
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::Embedded {
            listen: "0.0.0.0:1883".to_string(),
        }
    }
}

/// The aggregator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub total_rounds: usize,
    pub num_clients: usize,
    pub client_fraction: f32,
    pub local_epochs: usize,
    pub device: String,
    pub qos: Qos,
    pub poll_interval_ms: u64,
    pub round_deadline: Option<RoundDeadline>,
    pub evaluate_every: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub export_dir: Option<PathBuf>,
    pub metrics_path: Option<PathBuf>,
    pub model: ModelSpec,
    /// Held out samples the global model is evaluated on.
    pub evaluation: Option<DatasetSource>,
    pub seed: Option<u64>,
    pub registry_listen: String,
    pub broker: BrokerConfig,
    pub inbox_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            total_rounds: 10,
            num_clients: 1,
            client_fraction: 1.0,
            local_epochs: 1,
            device: "cpu".to_string(),
            qos: Qos::default(),
            poll_interval_ms: 100,
            round_deadline: None,
            evaluate_every: None,
            checkpoint_every: None,
            export_dir: None,
            metrics_path: None,
            model: ModelSpec::Dense {
                layers: vec![LayerSpec {
                    dim: (1, 1),
                    init: Default::default(),
                }],
            },
            evaluation: None,
            seed: None,
            registry_listen: "0.0.0.0:5000".to_string(),
            broker: BrokerConfig::default(),
            inbox_capacity: 1024,
        }
    }
}

impl AggregatorConfig {
    /// Loads the configuration from `path`, or the defaults if there is none, and
    /// applies the environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| AggregatorErr::Config(format!("reading {}: {e}", path.display())))?;

        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AggregatorErr::Config(e.to_string()))
    }

    /// Overrides the connection parameters with the `HOST`, `PORT` and
    /// `BROKER_ADDR` variables read through `var`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("HOST") {
            let port = self
                .registry_listen
                .rsplit_once(':')
                .map(|(_, port)| port.to_string())
                .unwrap_or_default();
            self.registry_listen = format!("{host}:{port}");
        }

        if let Some(port) = var("PORT") {
            let host = self
                .registry_listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| self.registry_listen.clone());
            self.registry_listen = format!("{host}:{port}");
        }

        if let Some(addr) = var("BROKER_ADDR") {
            match &mut self.broker {
                BrokerConfig::Embedded { listen } => *listen = addr,
                BrokerConfig::Remote { addr: remote } => *remote = addr,
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: &str| Err(AggregatorErr::Config(detail.to_string()));

        if self.total_rounds == 0 {
            return invalid("total_rounds must be at least 1");
        }
        if self.num_clients == 0 {
            return invalid("num_clients must be at least 1");
        }
        if !(self.client_fraction > 0.0 && self.client_fraction <= 1.0) {
            return invalid("client_fraction must be within (0, 1]");
        }
        if self.local_epochs == 0 {
            return invalid("local_epochs must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be at least 1");
        }
        if self.evaluate_every == Some(0) || self.checkpoint_every == Some(0) {
            return invalid("evaluate_every and checkpoint_every must be at least 1");
        }
        if self.inbox_capacity == 0 {
            return invalid("inbox_capacity must be at least 1");
        }

        self.model.validate()?;
        Ok(())
    }

    /// Returns the amount of clients the first round waits for.
    pub fn expected_clients(&self) -> usize {
        ((self.num_clients as f32 * self.client_fraction).floor() as usize).max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
