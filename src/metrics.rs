//! Fire-and-forget metrics.
//!
//! Subsystems report named events through a process-wide [`MetricSink`].
//! The default sink turns events into structured log lines under the
//! `metrics` target; deployments with a real collector replace it via
//! [`set_sink`]. Recording never blocks and never fails.

use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(i64),
    DurationMs(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Default sink: structured log lines under the `metrics` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: &MetricEvent) {
        match event.value {
            MetricValue::Counter(delta) => {
                debug!(target: "metrics", name = event.name, delta, "counter");
            }
            MetricValue::Gauge(value) => {
                debug!(target: "metrics", name = event.name, value, "gauge");
            }
            MetricValue::DurationMs(ms) => {
                debug!(target: "metrics", name = event.name, ms, "duration");
            }
        }
    }
}

fn sink_slot() -> &'static RwLock<Arc<dyn MetricSink>> {
    static SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();
    SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)))
}

/// Replaces the process-wide sink.
pub fn set_sink(sink: Arc<dyn MetricSink>) {
    *sink_slot().write().expect("metric sink lock poisoned") = sink;
}

pub fn emit(name: &'static str, value: MetricValue) {
    let sink = sink_slot()
        .read()
        .expect("metric sink lock poisoned")
        .clone();
    sink.record(&MetricEvent { name, value });
}

fn counter(name: &'static str, delta: u64) {
    emit(name, MetricValue::Counter(delta));
}

pub(crate) fn connection_accepted() {
    counter("bus.connections.accepted", 1);
}

pub(crate) fn connection_rejected() {
    counter("bus.connections.rejected", 1);
}

pub(crate) fn connection_terminated() {
    counter("bus.connections.terminated", 1);
}

pub(crate) fn changelog_append(records: u64, bytes: u64) {
    counter("changelog.append.records", records);
    counter("changelog.append.bytes", bytes);
}

pub(crate) fn changelog_truncate_wiped(bytes: u64) {
    counter("changelog.truncate.wiped_bytes", bytes);
}

pub(crate) fn changelog_recovery_dropped(bytes: u64) {
    counter("changelog.recovery.dropped_bytes", bytes);
}
