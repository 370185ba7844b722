//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process registers a callback that
//! receives name/value pairs for every counter, gauge and histogram update.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = fn(name: &str, value: u64);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register the collector and install the forwarding recorder. Only the
/// first registration in a process takes effect; returns whether this one
/// did.
pub fn register_stats_callback(cb: StatsCallback) -> bool {
    let fresh = CALLBACK.set(cb).is_ok();
    init();
    fresh
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct CallbackRecorder;

#[derive(Clone)]
struct Forward {
    key: Key,
}

impl Forward {
    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            cb(self.key.name(), value);
        }
    }
}

impl Recorder for CallbackRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(Forward { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(Forward { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(Forward { key: key.clone() }))
    }
}

impl metrics::CounterFn for Forward {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

// gauges and histograms are truncated to whole numbers
impl metrics::GaugeFn for Forward {
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for Forward {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once**. A recorder set by the host beforehand wins.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(CallbackRecorder);
    });
}
