pub mod dataset;
pub mod error;
pub mod factory;
mod params;
pub mod training;

pub use error::{ModelErr, Result};
pub use params::{ParameterMap, Tensor};
