use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use log::info;
use parking_lot::Mutex;

use crate::{MetricEvent, MetricsSink, Result};

/// Writes every event as a structured `info` record under the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&self, event: &MetricEvent) -> Result<()> {
        info!(
            target: "metrics",
            round = event.round,
            source = event.source.as_str(),
            name = event.name.as_str(),
            value = event.value;
            "metric"
        );

        Ok(())
    }
}

/// Appends every event as a JSON line to a file.
pub struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsSink for JsonLinesSink {
    fn record(&self, event: &MetricEvent) -> Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, event)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the events recorded so far.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Returns the values recorded under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, event: &MetricEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _event: &MetricEvent) -> Result<()> {
        Ok(())
    }
}
