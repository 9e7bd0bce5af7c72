//! The transport manager, one session per client bound to its topic pair.

mod manager;
mod session;

pub use manager::SessionManager;
pub use session::{ClientSession, Inbound};
