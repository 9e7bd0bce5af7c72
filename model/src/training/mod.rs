mod linear;
mod trainer;

pub use linear::LinearTrainer;
pub use trainer::{EvalMetrics, TrainMetrics, Trainer};
