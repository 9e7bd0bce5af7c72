//! The monitoring boundary of the system.
//!
//! Recording a metric never affects the protocol, callers go through
//! `record_quietly` so a failing sink is only logged.

mod error;
mod event;
mod sinks;

pub use error::{Result, SinkErr};
pub use event::MetricEvent;
pub use sinks::{JsonLinesSink, LogSink, MemorySink, NoopSink};

/// A destination for metric events.
pub trait MetricsSink: Send + Sync {
    /// Records a single event.
    fn record(&self, event: &MetricEvent) -> Result<()>;

    /// Persists anything the sink is buffering.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Records `event` into `sink`, logging instead of failing.
pub fn record_quietly(sink: &dyn MetricsSink, event: MetricEvent) {
    if let Err(e) = sink.record(&event) {
        log::warn!(round = event.round, name = event.name.as_str(); "failed to record metric: {e}");
    }
}
