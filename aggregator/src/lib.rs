pub mod collector;
pub mod config;
pub mod coordinator;
pub mod endpoint;
mod error;
pub mod export;
pub mod registry;
pub mod sessions;

pub use error::{AggregatorErr, Result};
