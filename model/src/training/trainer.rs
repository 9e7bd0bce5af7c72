use serde::{Deserialize, Serialize};

use crate::{ParameterMap, Result};

/// The scalar outcome of one round of local training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub loss: f32,
    pub accuracy: Option<f32>,
    /// The amount of samples seen in the last epoch.
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub accuracy: f32,
    pub loss: f32,
}

/// The local computation a client performs every round.
///
/// A trainer owns the data partition it trains and evaluates on, so the
/// protocol only ever hands it parameters.
pub trait Trainer: Send + Sync {
    /// Trains a copy of `params` for `epochs` epochs over the local partition.
    ///
    /// # Arguments
    /// * `params` - The parameters received from the aggregator.
    /// * `epochs` - The amount of passes over the local partition.
    ///
    /// # Returns
    /// The updated parameters and the training metrics.
    fn train_one_round(
        &mut self,
        params: &ParameterMap,
        epochs: usize,
    ) -> Result<(ParameterMap, TrainMetrics)>;

    /// Evaluates `params` over the held out partition.
    fn evaluate(&mut self, params: &ParameterMap) -> Result<EvalMetrics>;
}
