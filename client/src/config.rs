use std::{
    env, fs,
    path::{Path, PathBuf},
};

use comms::Qos;
use model::dataset::{Dataset, DatasetSource};
use serde::Deserialize;

use crate::{ClientErr, Result, registration::RetryPolicy, runtime::RuntimeConfig};

const DEFAULT_HOST_ID: &str = "client";

/// Where the local samples come from and which shard of them this client owns.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub source: DatasetSource,
    #[serde(default)]
    pub partition_index: usize,
    #[serde(default = "one")]
    pub partition_count: usize,
    /// The share of the shard used for training, the rest is used for testing.
    #[serde(default = "train_ratio")]
    pub train_ratio: f32,
}

fn one() -> usize {
    1
}

fn train_ratio() -> f32 {
    0.8
}

impl DatasetConfig {
    /// Loads the shard of this client and splits it into train and test sets.
    pub fn load(&self) -> Result<(Dataset, Dataset)> {
        let shard = self
            .source
            .load()?
            .partition(self.partition_index, self.partition_count)?;

        Ok(shard.split(self.train_ratio))
    }
}

/// The client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Defaults to the `HOSTNAME` of the machine.
    pub host_id: String,
    pub registry_addr: String,
    pub broker_addr: String,
    pub qos: Qos,
    /// Used when a broadcast doesn't say how many epochs to train.
    pub local_epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub test_every: Option<usize>,
    pub history_dir: Option<PathBuf>,
    pub metrics_path: Option<PathBuf>,
    pub dataset: Option<DatasetConfig>,
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            registry_addr: "127.0.0.1:5000".to_string(),
            broker_addr: "127.0.0.1:1883".to_string(),
            qos: Qos::default(),
            local_epochs: 1,
            learning_rate: 0.01,
            batch_size: 32,
            test_every: None,
            history_dir: None,
            metrics_path: None,
            dataset: None,
            seed: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from `path`, or the defaults if there is none, and
    /// applies the environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| ClientErr::Config(format!("reading {}: {e}", path.display())))?;
                Self::from_json(&text)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ClientErr::Config(e.to_string()))
    }

    /// Overrides the connection parameters with the `HOST`, `PORT`,
    /// `REGISTRY_ADDR`, `BROKER_ADDR` and `HOSTNAME` variables read through `var`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut host, mut port) = match self.registry_addr.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => (self.registry_addr.clone(), String::new()),
        };

        if let Some(value) = var("HOST") {
            host = value;
        }
        if let Some(value) = var("PORT") {
            port = value;
        }
        self.registry_addr = format!("{host}:{port}");

        if let Some(addr) = var("REGISTRY_ADDR") {
            self.registry_addr = addr;
        }
        if let Some(addr) = var("BROKER_ADDR") {
            self.broker_addr = addr;
        }

        if self.host_id.is_empty() {
            self.host_id = var("HOSTNAME").unwrap_or_else(|| DEFAULT_HOST_ID.to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: &str| Err(ClientErr::Config(detail.to_string()));

        if self.host_id.is_empty() {
            return invalid("host_id can't be empty");
        }
        if self.local_epochs == 0 || self.batch_size == 0 {
            return invalid("local_epochs and batch_size must be at least 1");
        }
        if !(self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if self.test_every == Some(0) {
            return invalid("test_every must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }

        match &self.dataset {
            None => invalid("a dataset is required"),
            Some(d) if d.partition_index >= d.partition_count => {
                invalid("dataset.partition_index must be below dataset.partition_count")
            }
            Some(d) if !(d.train_ratio > 0.0 && d.train_ratio <= 1.0) => {
                invalid("dataset.train_ratio must be within (0, 1]")
            }
            Some(_) => Ok(()),
        }
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            qos: self.qos,
            fallback_epochs: self.local_epochs,
            test_every: self.test_every,
            history_dir: self.history_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const JSON: &str = r#"{
        "host_id": "edge-7",
        "qos": 1,
        "test_every": 2,
        "dataset": {
            "source": { "kind": "inline", "x_size": 1, "y_size": 1, "data": [0, 1, 1, 3, 2, 5, 3, 7, 4, 9, 5, 11, 6, 13, 7, 15] },
            "partition_index": 1,
            "partition_count": 2,
            "train_ratio": 0.5
        },
        "retry": { "max_attempts": 2 }
    }"#;

    #[test]
    fn test_json_with_partial_sections() {
        let config = ClientConfig::from_json(JSON).unwrap();

        assert_eq!(config.host_id, "edge-7");
        assert_eq!(config.qos, Qos::AtLeastOnce);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.multiplier, RetryPolicy::default().multiplier);
        config.validate().unwrap();

        let (train, test) = config.dataset.unwrap().load().unwrap();
        assert_eq!((train.len(), test.len()), (2, 2));
        assert_eq!(train.x()[[0, 0]], 4.0);
    }

    #[test]
    fn test_env_overrides_connection_parameters() {
        let vars: HashMap<&str, &str> = [
            ("PORT", "7000"),
            ("BROKER_ADDR", "broker:1883"),
            ("HOSTNAME", "node-3"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.registry_addr, "127.0.0.1:7000");
        assert_eq!(config.broker_addr, "broker:1883");
        assert_eq!(config.host_id, "node-3");

        config.apply_env(|key| (key == "REGISTRY_ADDR").then(|| "agg:5000".to_string()));
        assert_eq!(config.registry_addr, "agg:5000");
        assert_eq!(config.host_id, "node-3");
    }

    #[test]
    fn test_missing_dataset_is_invalid() {
        let mut config = ClientConfig::default();
        config.apply_env(|_| None);

        assert_eq!(config.host_id, DEFAULT_HOST_ID);
        assert!(matches!(config.validate(), Err(ClientErr::Config(_))));
    }
}
