use log::*;
use std::sync::Mutex;

pub const ALCT_FREE_SEGMENT_COUNT: &str = "alct_free_segment_count";
pub const ALCT_GC_MODE: &str = "alct_gc_mode";
pub const ALCT_LAST_ALLOCATED_SEGMENT: &str = "alct_last_allocated_segment";
pub const ALCT_GC_VICTIM_SEGMENT: &str = "alct_gc_victim_segment";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Fire-and-forget metric sink.  The process entry point owns the concrete
/// publisher and injects it; the core never assumes one exists.
pub trait TelemetryPublisher: Send + Sync {
    fn publish(&self, metric: &'static str, kind: MetricKind, value: i64);
}

pub struct NullTelemetry;

impl TelemetryPublisher for NullTelemetry {
    fn publish(&self, metric: &'static str, _kind: MetricKind, value: i64) {
        trace!("telemetry (dropped): {}={}", metric, value);
    }
}

/// Records every published data point; used by tests to observe gauge
/// transitions.
#[derive(Default)]
pub struct RecordingTelemetry {
    points: Mutex<Vec<(&'static str, i64)>>,
}

impl RecordingTelemetry {
    pub fn points_for(&self, metric: &'static str) -> Vec<i64> {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == metric)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn last_for(&self, metric: &'static str) -> Option<i64> {
        self.points_for(metric).last().copied()
    }
}

impl TelemetryPublisher for RecordingTelemetry {
    fn publish(&self, metric: &'static str, _kind: MetricKind, value: i64) {
        self.points.lock().unwrap().push((metric, value));
    }
}
