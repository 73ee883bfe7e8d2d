//! Metrics export functionality for simulation results.
//!
//! This module provides an in-memory metrics recorder that collects metrics
//! during simulation and can export them in JSON or Prometheus format.
//!
//! Every metric is aggregated by name. Series carrying a `node` label are also
//! broken down per node, and series carrying other labels (such as
//! `frame_type`) are kept under their label set as well.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use spcsim_common::SimTime;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Metrics Snapshot Types
// ============================================================================

/// Per-node metric values.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct NodeMetrics {
    /// Counter metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics for this node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Simulated time at which the snapshot was taken, in seconds.
    pub simulation_time_s: f64,
    /// Counter metrics (name -> value) - aggregated across all nodes.
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics (name -> value) - last value seen across all nodes.
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics (name -> summary stats) - aggregated across all nodes.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Counters broken down by their non-node labels, e.g. `name{frame_type="rts"}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labelled_counters: BTreeMap<String, u64>,
    /// Per-node breakdown of metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistogramSummary {
    /// Number of samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
    /// Mean value.
    pub mean: f64,
    /// 50th percentile (median).
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl HistogramSummary {
    fn empty() -> Self {
        HistogramSummary {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        }
    }
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics as JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

/// Export metrics in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(
    snapshot: &MetricsSnapshot,
    writer: &mut W,
) -> std::io::Result<()> {
    // Counters - aggregated, then per label set, then per node
    for (name, value) in &snapshot.counters {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} counter", prom_name)?;
        writeln!(writer, "{} {}", prom_name, value)?;
    }
    for (series, value) in &snapshot.labelled_counters {
        writeln!(writer, "{} {}", prometheus_name(series), value)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, value) in &node_metrics.counters {
            writeln!(writer, "{}{{node=\"{}\"}} {}", prometheus_name(name), node_name, value)?;
        }
    }

    for (name, value) in &snapshot.gauges {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} gauge", prom_name)?;
        writeln!(writer, "{} {}", prom_name, value)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, value) in &node_metrics.gauges {
            writeln!(writer, "{}{{node=\"{}\"}} {}", prometheus_name(name), node_name, value)?;
        }
    }

    // Histograms as summaries with quantiles
    for (name, summary) in &snapshot.histograms {
        let prom_name = prometheus_name(name);
        writeln!(writer, "# TYPE {} summary", prom_name)?;
        writeln!(writer, "{}_count {}", prom_name, summary.count)?;
        writeln!(writer, "{}_sum {}", prom_name, summary.sum)?;
        writeln!(writer, "{}{{quantile=\"0.5\"}} {}", prom_name, summary.p50)?;
        writeln!(writer, "{}{{quantile=\"0.9\"}} {}", prom_name, summary.p90)?;
        writeln!(writer, "{}{{quantile=\"0.99\"}} {}", prom_name, summary.p99)?;
    }
    for (node_name, node_metrics) in &snapshot.nodes {
        for (name, summary) in &node_metrics.histograms {
            let prom_name = prometheus_name(name);
            writeln!(writer, "{}_count{{node=\"{}\"}} {}", prom_name, node_name, summary.count)?;
            writeln!(writer, "{}_sum{{node=\"{}\"}} {}", prom_name, node_name, summary.sum)?;
            writeln!(writer, "{}{{node=\"{}\",quantile=\"0.5\"}} {}", prom_name, node_name, summary.p50)?;
            writeln!(writer, "{}{{node=\"{}\",quantile=\"0.9\"}} {}", prom_name, node_name, summary.p90)?;
            writeln!(writer, "{}{{node=\"{}\",quantile=\"0.99\"}} {}", prom_name, node_name, summary.p99)?;
        }
    }

    Ok(())
}

/// Dotted metric names become underscored; a label block is left intact.
fn prometheus_name(series: &str) -> String {
    match series.split_once('{') {
        Some((name, labels)) => format!("{}{{{}", name.replace('.', "_"), labels),
        None => series.replace('.', "_"),
    }
}

// ============================================================================
// In-Memory Recorder
// ============================================================================

/// Thread-safe storage for a single counter value.
#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge value stored as f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((f64::from_bits(current) + value).to_bits())
            });
    }

    fn decrement(&self, value: f64) {
        self.increment(-value);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Maximum number of samples retained per histogram for percentiles.
const HISTOGRAM_RESERVOIR_SIZE: usize = 10_000;

/// Histogram samples kept with reservoir sampling (Algorithm R).
///
/// Count, sum, min and max are exact; percentiles come from the reservoir.
#[derive(Debug)]
struct HistogramState {
    inner: RwLock<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    reservoir: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// xorshift64 state for replacement draws.
    rng_state: u64,
}

impl Default for HistogramState {
    fn default() -> Self {
        HistogramState {
            inner: RwLock::new(HistogramInner {
                reservoir: Vec::new(),
                count: 0,
                sum: 0.0,
                min: f64::MAX,
                max: f64::MIN,
                rng_state: 0x12345678_9ABCDEF0,
            }),
        }
    }
}

impl HistogramInner {
    fn next_random(&mut self) -> u64 {
        let mut state = self.rng_state;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state = state;
        state
    }
}

impl HistogramState {
    fn record(&self, value: f64) {
        let mut inner = self.inner.write();
        inner.count += 1;
        inner.sum += value;
        inner.min = inner.min.min(value);
        inner.max = inner.max.max(value);

        let n = inner.count;
        if inner.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            inner.reservoir.push(value);
        } else {
            let j = (inner.next_random() % n) as usize;
            if j < HISTOGRAM_RESERVOIR_SIZE {
                inner.reservoir[j] = value;
            }
        }
    }

    fn summary(&self) -> HistogramSummary {
        let inner = self.inner.read();
        if inner.count == 0 {
            return HistogramSummary::empty();
        }
        let mut summary = compute_histogram_summary(&inner.reservoir);
        summary.count = inner.count;
        summary.sum = inner.sum;
        summary.min = inner.min;
        summary.max = inner.max;
        summary.mean = inner.sum / inner.count as f64;
        summary
    }

    fn samples(&self) -> Vec<f64> {
        self.inner.read().reservoir.clone()
    }
}

/// Summary over a plain list of samples.
fn compute_histogram_summary(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::empty();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    let sum: f64 = sorted.iter().sum();

    HistogramSummary {
        count: sorted.len() as u64,
        sum,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / sorted.len() as f64,
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
    }
}

/// Metric name and labels of one registered series.
#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    labels: Vec<(String, String)>,
}

impl KeyMetadata {
    fn from_key(key: &Key) -> Self {
        KeyMetadata {
            name: key.name().to_string(),
            labels: key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect(),
        }
    }

    fn node(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == "node")
            .map(|(_, v)| v.as_str())
    }

    /// Series name with every label except `node`, or None when there are none.
    fn labelled_name(&self) -> Option<String> {
        let extra: Vec<String> = self
            .labels
            .iter()
            .filter(|(k, _)| k != "node")
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        if extra.is_empty() {
            None
        } else {
            Some(format!("{}{{{}}}", self.name, extra.join(",")))
        }
    }
}

/// Build a unique key string from a metrics Key (including labels).
fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();

    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}|{}", key.name(), labels.join(","))
    }
}

/// Shared state for the in-memory recorder.
#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<String, Arc<HistogramState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
}

impl RecorderState {
    fn remember(&self, key_str: &str, key: &Key) {
        self.key_metadata
            .write()
            .entry(key_str.to_string())
            .or_insert_with(|| KeyMetadata::from_key(key));
    }

    fn get_or_create_counter(&self, key: &Key) -> Arc<CounterState> {
        let key_str = key_to_string(key);
        if let Some(counter) = self.counters.read().get(&key_str) {
            return counter.clone();
        }
        self.remember(&key_str, key);
        self.counters.write().entry(key_str).or_default().clone()
    }

    fn get_or_create_gauge(&self, key: &Key) -> Arc<GaugeState> {
        let key_str = key_to_string(key);
        if let Some(gauge) = self.gauges.read().get(&key_str) {
            return gauge.clone();
        }
        self.remember(&key_str, key);
        self.gauges.write().entry(key_str).or_default().clone()
    }

    fn get_or_create_histogram(&self, key: &Key) -> Arc<HistogramState> {
        let key_str = key_to_string(key);
        if let Some(histogram) = self.histograms.read().get(&key_str) {
            return histogram.clone();
        }
        self.remember(&key_str, key);
        self.histograms.write().entry(key_str).or_default().clone()
    }

    fn snapshot(&self, time: SimTime) -> MetricsSnapshot {
        let metadata = self.key_metadata.read();

        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut agg_histograms: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut labelled_counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = counter.get();
            *counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(series) = meta.labelled_name() {
                *labelled_counters.entry(series).or_insert(0) += value;
            }
            if let Some(node) = meta.node() {
                let node_metrics = nodes.entry(node.to_string()).or_default();
                *node_metrics.counters.entry(meta.name.clone()).or_insert(0) += value;
            }
        }

        // Gauges don't sum; the last series in key order wins the aggregate.
        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = gauge.get();
            gauges.insert(meta.name.clone(), value);
            if let Some(node) = meta.node() {
                let node_metrics = nodes.entry(node.to_string()).or_default();
                node_metrics.gauges.insert(meta.name.clone(), value);
            }
        }

        for (key_str, histogram) in self.histograms.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            agg_histograms
                .entry(meta.name.clone())
                .or_default()
                .extend(histogram.samples());
            if let Some(node) = meta.node() {
                let node_metrics = nodes.entry(node.to_string()).or_default();
                node_metrics
                    .histograms
                    .insert(meta.name.clone(), histogram.summary());
            }
        }

        let histograms = agg_histograms
            .into_iter()
            .map(|(name, samples)| (name, compute_histogram_summary(&samples)))
            .collect();

        MetricsSnapshot {
            simulation_time_s: time.as_secs_f64(),
            counters,
            gauges,
            histograms,
            labelled_counters,
            nodes,
        }
    }
}

/// In-memory recorder installed as the global `metrics` recorder.
#[derive(Debug, Clone)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create a new in-memory recorder.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RecorderState::default()),
        }
    }

    /// Take a snapshot of all current metric values.
    pub fn snapshot(&self, time: SimTime) -> MetricsSnapshot {
        self.state.snapshot(time)
    }
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.store(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.decrement(value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create_counter(key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create_gauge(key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = self.state.get_or_create_histogram(key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;
    use spcsim_common::metric_defs;

    fn node_key(name: &'static str, node: &'static str, extra: Option<(&'static str, &'static str)>) -> Key {
        let mut labels = vec![Label::new("node", node)];
        if let Some((k, v)) = extra {
            labels.push(Label::new(k, v));
        }
        Key::from_parts(name, labels)
    }

    #[test]
    fn test_counter_increment() {
        let recorder = InMemoryRecorder::new();
        let key = Key::from_static_name("test.counter");
        let counter = recorder.state.get_or_create_counter(&key);
        counter.increment(5);
        counter.increment(3);
        assert_eq!(counter.get(), 8);
    }

    #[test]
    fn test_gauge_operations() {
        let recorder = InMemoryRecorder::new();
        let gauge = recorder
            .state
            .get_or_create_gauge(&Key::from_static_name("test.gauge"));
        gauge.set(10.0);
        gauge.increment(5.0);
        gauge.decrement(3.0);
        assert!((gauge.get() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_summary() {
        let recorder = InMemoryRecorder::new();
        let histogram = recorder
            .state
            .get_or_create_histogram(&Key::from_static_name("test.histogram"));
        for i in 1..=100 {
            histogram.record(i as f64);
        }

        let summary = histogram.summary();
        assert_eq!(summary.count, 100);
        assert!((summary.min - 1.0).abs() < f64::EPSILON);
        assert!((summary.max - 100.0).abs() < f64::EPSILON);
        assert!((summary.mean - 50.5).abs() < f64::EPSILON);
        assert!((summary.p50 - 50.0).abs() < 2.0);
        assert!((summary.p99 - 99.0).abs() < 2.0);
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let recorder = InMemoryRecorder::new();
        let histogram = recorder
            .state
            .get_or_create_histogram(&Key::from_static_name("test.histogram"));
        for i in 0..(HISTOGRAM_RESERVOIR_SIZE * 3) {
            histogram.record(i as f64);
        }
        assert_eq!(histogram.samples().len(), HISTOGRAM_RESERVOIR_SIZE);
        assert_eq!(histogram.summary().count, (HISTOGRAM_RESERVOIR_SIZE * 3) as u64);
    }

    #[test]
    fn test_per_node_and_label_breakdown() {
        let recorder = InMemoryRecorder::new();
        let name = metric_defs::MAC_TX_FRAMES.name;
        recorder
            .state
            .get_or_create_counter(&node_key(name, "ap", Some(("frame_type", "rts_spc"))))
            .increment(4);
        recorder
            .state
            .get_or_create_counter(&node_key(name, "ap", Some(("frame_type", "data_spc"))))
            .increment(3);
        recorder
            .state
            .get_or_create_counter(&node_key(name, "near", Some(("frame_type", "cts_spc"))))
            .increment(2);

        let snapshot = recorder.snapshot(SimTime::from_secs(1.5));
        assert_eq!(snapshot.counters.get(name), Some(&9));
        assert_eq!(snapshot.nodes["ap"].counters.get(name), Some(&7));
        assert_eq!(snapshot.nodes["near"].counters.get(name), Some(&2));
        assert_eq!(
            snapshot
                .labelled_counters
                .get(&format!("{}{{frame_type=\"rts_spc\"}}", name)),
            Some(&4)
        );
        assert!((snapshot.simulation_time_s - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_export_json() {
        let recorder = InMemoryRecorder::new();
        recorder
            .state
            .get_or_create_counter(&node_key(metric_defs::APP_BYTES_RECEIVED.name, "far", None))
            .increment(1500);

        let mut output = Vec::new();
        export_json(&recorder.snapshot(SimTime::ZERO), &mut output).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["counters"]["spcsim.app.bytes_received"], 1500);
        assert_eq!(value["nodes"]["far"]["counters"]["spcsim.app.bytes_received"], 1500);
    }

    #[test]
    fn test_export_prometheus() {
        let recorder = InMemoryRecorder::new();
        recorder
            .state
            .get_or_create_counter(&node_key(metric_defs::MAC_TX_FRAMES.name, "ap", Some(("frame_type", "rts"))))
            .increment(10);
        recorder
            .state
            .get_or_create_gauge(&node_key(metric_defs::QUEUE_LENGTH.name, "ap", None))
            .set(5.5);
        recorder
            .state
            .get_or_create_histogram(&node_key(metric_defs::MAC_SPC_POWER_SPLIT.name, "ap", None))
            .record(0.8);

        let mut output = Vec::new();
        export_prometheus(&recorder.snapshot(SimTime::ZERO), &mut output).unwrap();
        let prom = String::from_utf8(output).unwrap();
        assert!(prom.contains("# TYPE spcsim_mac_tx_frames counter"));
        assert!(prom.contains("spcsim_mac_tx_frames 10"));
        assert!(prom.contains("spcsim_mac_tx_frames{frame_type=\"rts\"} 10"));
        assert!(prom.contains("spcsim_mac_tx_frames{node=\"ap\"} 10"));
        assert!(prom.contains("# TYPE spcsim_queue_length gauge"));
        assert!(prom.contains("spcsim_queue_length 5.5"));
        assert!(prom.contains("spcsim_mac_spc_power_split_count 1"));
        assert!(prom.contains("spcsim_mac_spc_power_split{node=\"ap\",quantile=\"0.5\"} 0.8"));
    }
}
