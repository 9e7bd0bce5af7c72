pub mod config;
mod error;
pub mod history;
pub mod registration;
pub mod runtime;

pub use error::{ClientErr, Result};
