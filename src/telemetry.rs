//! Instrumentation hooks.
//!
//! Components never reach for a global collector. A `TelemetrySink` is built by
//! the caller and handed to the agent server, the orchestrator and the transfer
//! manager as `Arc<dyn TelemetrySink>`. Collection, storage and exposition are
//! the sink's business.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait TelemetrySink: Send + Sync {
    /// Add `value` to a monotonically increasing counter.
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>);

    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);

    fn timer(&self, name: &str, elapsed: Duration, labels: Labels<'_>);

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>);

    /// Push buffered measurements to wherever the sink sends them.
    fn flush(&self) {}

    /// Flush and release resources. Measurements after shutdown are dropped.
    fn shutdown(&self) {
        self.flush();
    }
}

pub type SharedSink = Arc<dyn TelemetrySink>;

pub fn noop() -> SharedSink {
    Arc::new(NoopSink)
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn counter(&self, _: &str, _: u64, _: Labels<'_>) {}
    fn gauge(&self, _: &str, _: f64, _: Labels<'_>) {}
    fn timer(&self, _: &str, _: Duration, _: Labels<'_>) {}
    fn histogram(&self, _: &str, _: f64, _: Labels<'_>) {}
}

/// Emits every measurement as a `tracing` debug event under the `telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        tracing::debug!(target: "telemetry", metric = name, kind = "counter", value, labels = ?labels);
    }

    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::debug!(target: "telemetry", metric = name, kind = "gauge", value, labels = ?labels);
    }

    fn timer(&self, name: &str, elapsed: Duration, labels: Labels<'_>) {
        tracing::debug!(
            target: "telemetry",
            metric = name,
            kind = "timer",
            elapsed_ms = elapsed.as_millis() as u64,
            labels = ?labels
        );
    }

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::debug!(target: "telemetry", metric = name, kind = "histogram", value, labels = ?labels);
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    observations: HashMap<String, Vec<f64>>,
    closed: bool,
}

/// In-process aggregation keyed by metric name. Labels are not part of the key.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.state.lock().gauges.get(name).copied()
    }

    /// Timer (in milliseconds) and histogram samples recorded under `name`.
    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.state
            .lock()
            .observations
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn observe(&self, name: &str, value: f64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state
            .observations
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

impl TelemetrySink for MemorySink {
    fn counter(&self, name: &str, value: u64, _: Labels<'_>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        *state.counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64, _: Labels<'_>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.gauges.insert(name.to_string(), value);
    }

    fn timer(&self, name: &str, elapsed: Duration, _: Labels<'_>) {
        self.observe(name, elapsed.as_secs_f64() * 1000.0);
    }

    fn histogram(&self, name: &str, value: f64, _: Labels<'_>) {
        self.observe(name, value);
    }

    fn shutdown(&self) {
        self.state.lock().closed = true;
    }
}
