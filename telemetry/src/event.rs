use serde::{Deserialize, Serialize};

/// A single scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub round: usize,
    /// The client id, or `aggregator` for global metrics.
    pub source: String,
    pub name: String,
    pub value: f64,
}

impl MetricEvent {
    pub fn new(round: usize, source: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            round,
            source: source.into(),
            name: name.into(),
            value,
        }
    }
}
