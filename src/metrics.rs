//! Custom metrics registry — counters, gauges, and histograms with label
//! sets, plus Prometheus-compatible textual export.

use std::collections::BTreeMap;
use std::sync::RwLock;

const HISTOGRAM_CAPACITY: usize = 1000;
const BUCKET_BOUNDS: [f64; 7] = [10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0];

/// Sorted label set. Labels are rendered `k1="v1",k2="v2"` in key order.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone)]
enum Value {
    Counter(f64),
    Gauge(f64),
    Histogram(Vec<f64>),
}

#[derive(Default)]
struct Registry {
    values: std::collections::HashMap<String, Value>,
    /// Preserves declaration order for deterministic `to_text` output and
    /// records which metric name/help belongs to which kind.
    declared: Vec<(String, MetricKind)>,
    help: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Summary statistics derived from a histogram's retained observations.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Counters / gauges / histograms keyed by name + sorted label set.
pub struct MetricsRegistry {
    inner: RwLock<Registry>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a HELP string for a metric, used only in textual export.
    pub fn set_help(&self, name: &str, help: impl Into<String>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.help.insert(name.to_string(), help.into());
    }

    /// Monotonic add. `amount` defaults to 1 when omitted by callers.
    pub fn inc_counter(&self, name: &str, labels: &Labels, amount: f64) {
        let key = compose_key(name, labels);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        declare(&mut guard, name, MetricKind::Counter);
        match guard.values.get_mut(&key) {
            Some(Value::Counter(v)) => *v += amount,
            _ => {
                guard.values.insert(key, Value::Counter(amount));
            }
        }
    }

    /// Last-write-wins absolute value.
    pub fn set_gauge(&self, name: &str, labels: &Labels, value: f64) {
        let key = compose_key(name, labels);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        declare(&mut guard, name, MetricKind::Gauge);
        guard.values.insert(key, Value::Gauge(value));
    }

    /// Append an observation, dropping the oldest once the ring exceeds
    /// `HISTOGRAM_CAPACITY`.
    pub fn record_histogram(&self, name: &str, labels: &Labels, value: f64) {
        let key = compose_key(name, labels);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        declare(&mut guard, name, MetricKind::Histogram);
        match guard.values.get_mut(&key) {
            Some(Value::Histogram(obs)) => {
                obs.push(value);
                if obs.len() > HISTOGRAM_CAPACITY {
                    obs.remove(0);
                }
            }
            _ => {
                guard.values.insert(key, Value::Histogram(vec![value]));
            }
        }
    }

    pub fn counter(&self, name: &str, labels: &Labels) -> f64 {
        let key = compose_key(name, labels);
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match guard.values.get(&key) {
            Some(Value::Counter(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn gauge(&self, name: &str, labels: &Labels) -> f64 {
        let key = compose_key(name, labels);
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match guard.values.get(&key) {
            Some(Value::Gauge(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn histogram_stats(&self, name: &str, labels: &Labels) -> Option<HistogramStats> {
        let key = compose_key(name, labels);
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let obs = match guard.values.get(&key) {
            Some(Value::Histogram(obs)) if !obs.is_empty() => obs.clone(),
            _ => return None,
        };
        Some(summarize(&obs))
    }

    /// Clear every metric. Testing only.
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.values.clear();
        guard.declared.clear();
        guard.help.clear();
    }

    /// Prometheus-compatible textual export, terminated with a newline.
    pub fn to_text(&self) -> String {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();

        for (name, kind) in &guard.declared {
            let help = guard.help.get(name).cloned().unwrap_or_else(|| format!("{name} metric"));
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} {}\n", kind.as_str()));

            let mut entries: Vec<(&String, &Value)> = guard
                .values
                .iter()
                .filter(|(k, _)| k.as_str() == name.as_str() || k.starts_with(&format!("{name}{{")))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            for (key, value) in entries {
                match value {
                    Value::Counter(v) => out.push_str(&format!("{key} {v}\n")),
                    Value::Gauge(v) => out.push_str(&format!("{key} {v}\n")),
                    Value::Histogram(obs) => {
                        if obs.is_empty() {
                            continue;
                        }
                        let stats = summarize(obs);
                        let label_suffix = key.strip_prefix(name.as_str()).unwrap_or("");
                        let has_labels = label_suffix.starts_with('{');
                        for bound in BUCKET_BOUNDS {
                            let le_count = obs.iter().filter(|&&v| v <= bound).count();
                            out.push_str(&bucket_line(name, label_suffix, has_labels, &format!("{bound}"), le_count));
                        }
                        out.push_str(&bucket_line(name, label_suffix, has_labels, "+Inf", obs.len()));
                        out.push_str(&format!("{name}_sum{label_suffix} {}\n", stats.sum));
                        out.push_str(&format!("{name}_count{label_suffix} {}\n", stats.count));
                    }
                }
            }
        }

        out
    }
}

fn bucket_line(name: &str, label_suffix: &str, has_labels: bool, bound: &str, count: usize) -> String {
    if has_labels {
        let inner = label_suffix.trim_start_matches('{').trim_end_matches('}');
        format!("{name}_bucket{{{inner},le=\"{bound}\"}} {count}\n")
    } else {
        format!("{name}_bucket{{le=\"{bound}\"}} {count}\n")
    }
}

fn declare(guard: &mut Registry, name: &str, kind: MetricKind) {
    if !guard.declared.iter().any(|(n, _)| n == name) {
        guard.declared.push((name.to_string(), kind));
    }
}

/// `name{k1="v1",k2="v2"}`, or plain `name` when labels are empty.
fn compose_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", pairs.join(","))
}

/// p_k = value at index floor(count*k/100), 0 <= k <= 99 after floor.
fn summarize(observations: &[f64]) -> HistogramStats {
    let mut sorted = observations.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();

    let percentile = |k: f64| -> f64 {
        let idx = ((count as f64) * k / 100.0).floor() as usize;
        sorted[idx.min(count - 1)]
    };

    HistogramStats {
        count: count as u64,
        sum,
        avg: sum / count as f64,
        min: sorted[0],
        max: sorted[count - 1],
        p50: percentile(50.0),
        p95: percentile(95.0),
        p99: percentile(99.0),
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
