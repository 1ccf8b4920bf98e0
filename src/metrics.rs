// Metrics module - in-process counters, gauges, and fixed-bucket histograms
//
// Series are keyed by "name:label1:label2" where the label portion is the
// colon-joined label values in declared order ("_" when a series carries no
// labels). Everything lives in one mutex-guarded table; critical sections are
// a single map operation, so contention is negligible next to network I/O.
// A poisoned lock degrades to a no-op rather than panicking the request path.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Upper bounds (milliseconds) for the duration histogram buckets. The +Inf
/// bucket is tracked separately.
pub const BUCKET_BOUNDS: [u64; 10] = [10, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

/// One histogram series: cumulative bucket counts plus sum/count totals.
#[derive(Debug, Clone, Default)]
struct Histogram {
    /// buckets[i] counts observations <= BUCKET_BOUNDS[i] (cumulative).
    buckets: [u64; BUCKET_BOUNDS.len()],
    /// Count of all observations regardless of magnitude.
    inf: u64,
    sum: u64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: u64) {
        for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
            if value <= *bound {
                self.buckets[i] += 1;
            }
        }
        self.inf += 1;
        self.sum += value;
        self.count += 1;
    }

    /// Estimate the `p`-quantile (0 < p < 1) by locating the first cumulative
    /// bucket reaching `p * count` and interpolating linearly between the
    /// bucket's lower and upper bound. Returns 0 for an empty histogram; if
    /// only the +Inf bucket reaches the target, the largest defined bound is
    /// returned.
    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = p * self.count as f64;
        let mut lower_bound = 0.0;
        let mut below = 0.0;
        for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
            let cumulative = self.buckets[i] as f64;
            if cumulative >= target {
                let in_bucket = cumulative - below;
                if in_bucket <= 0.0 {
                    return *bound as f64;
                }
                let fraction = (target - below) / in_bucket;
                return lower_bound + (*bound as f64 - lower_bound) * fraction;
            }
            lower_bound = *bound as f64;
            below = cumulative;
        }
        *BUCKET_BOUNDS.last().expect("bucket bounds non-empty") as f64
    }
}

#[derive(Default)]
struct Tables {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, i64>,
    histograms: HashMap<String, Histogram>,
}

/// Process-wide metrics store, shared by every listener.
pub struct MetricsRegistry {
    tables: std::sync::Mutex<Tables>,
    started: Instant,
}

/// Map an HTTP status code to its class bucket ("2xx" for 200-299, etc.).
pub fn status_class(code: u16) -> &'static str {
    match code / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "other",
    }
}

fn series_key(name: &str, labels: &[&str]) -> String {
    if labels.is_empty() {
        format!("{name}:_")
    } else {
        format!("{name}:{}", labels.join(":"))
    }
}

/// Split a series key back into (name, labelkey) for the snapshot views.
fn split_key(key: &str) -> (&str, &str) {
    match key.split_once(':') {
        Some((name, labels)) => (name, labels),
        None => (key, "_"),
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            tables: std::sync::Mutex::new(Tables::default()),
            started: Instant::now(),
        }
    }

    /// Add `delta` to a counter, creating it at zero on first write.
    pub fn increment(&self, name: &str, labels: &[&str], delta: u64) {
        let Ok(mut tables) = self.tables.lock() else {
            return;
        };
        *tables.counters.entry(series_key(name, labels)).or_insert(0) += delta;
    }

    pub fn gauge_inc(&self, name: &str, labels: &[&str]) {
        self.gauge_add(name, labels, 1);
    }

    pub fn gauge_dec(&self, name: &str, labels: &[&str]) {
        self.gauge_add(name, labels, -1);
    }

    pub fn gauge_set(&self, name: &str, labels: &[&str], value: i64) {
        let Ok(mut tables) = self.tables.lock() else {
            return;
        };
        tables.gauges.insert(series_key(name, labels), value);
    }

    fn gauge_add(&self, name: &str, labels: &[&str], delta: i64) {
        let Ok(mut tables) = self.tables.lock() else {
            return;
        };
        *tables.gauges.entry(series_key(name, labels)).or_insert(0) += delta;
    }

    /// Record one observation into a histogram series.
    pub fn observe(&self, name: &str, labels: &[&str], value: u64) {
        let Ok(mut tables) = self.tables.lock() else {
            return;
        };
        tables
            .histograms
            .entry(series_key(name, labels))
            .or_default()
            .observe(value);
    }

    /// Seconds since the registry (and effectively the process) started.
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Deep snapshot for the `/metrics` endpoint: nested name -> labelkey
    /// maps, histogram quantiles, and a synthetic `uptime_seconds` gauge.
    pub fn snapshot(&self) -> Value {
        let Ok(tables) = self.tables.lock() else {
            return json!({"counters": {}, "histograms": {}, "gauges": {"uptime_seconds": self.uptime_seconds()}});
        };

        let mut counters: Map<String, Value> = Map::new();
        for (key, value) in &tables.counters {
            let (name, labels) = split_key(key);
            counters
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("counter entry is an object")
                .insert(labels.to_string(), json!(value));
        }

        let mut histograms: Map<String, Value> = Map::new();
        for (key, h) in &tables.histograms {
            let (name, labels) = split_key(key);
            let mut buckets: Map<String, Value> = Map::new();
            for (i, bound) in BUCKET_BOUNDS.iter().enumerate() {
                buckets.insert(bound.to_string(), json!(h.buckets[i]));
            }
            buckets.insert("+Inf".to_string(), json!(h.inf));
            histograms
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("histogram entry is an object")
                .insert(
                    labels.to_string(),
                    json!({
                        "p50": h.percentile(0.5),
                        "p90": h.percentile(0.9),
                        "p99": h.percentile(0.99),
                        "count": h.count,
                        "sum": h.sum,
                        "buckets": buckets,
                    }),
                );
        }

        let mut gauges: Map<String, Value> = Map::new();
        for (key, value) in &tables.gauges {
            let (name, labels) = split_key(key);
            gauges
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("gauge entry is an object")
                .insert(labels.to_string(), json!(value));
        }
        gauges.insert("uptime_seconds".to_string(), json!(self.uptime_seconds()));

        json!({
            "counters": counters,
            "histograms": histograms,
            "gauges": gauges,
        })
    }

    /// Aggregate view for the health document.
    pub fn summary(&self) -> Value {
        let Ok(tables) = self.tables.lock() else {
            return json!({
                "total_requests": 0,
                "total_errors": 0,
                "active_requests": 0,
                "avg_latency_ms": 0.0,
            });
        };

        let sum_counters = |prefix: &str| -> u64 {
            tables
                .counters
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(_, v)| *v)
                .sum()
        };

        let total_requests = sum_counters("requests_total:");
        let total_errors = sum_counters("requests_errors_total:");
        let active_requests: i64 = tables
            .gauges
            .iter()
            .filter(|(key, _)| key.starts_with("active_requests:"))
            .map(|(_, v)| *v)
            .sum();

        let (dur_sum, dur_count) = tables
            .histograms
            .iter()
            .filter(|(key, _)| key.starts_with("request_duration_ms:"))
            .fold((0u64, 0u64), |(s, c), (_, h)| (s + h.sum, c + h.count));
        let avg_latency_ms = if dur_count == 0 {
            0.0
        } else {
            dur_sum as f64 / dur_count as f64
        };

        json!({
            "total_requests": total_requests,
            "total_errors": total_errors,
            "active_requests": active_requests,
            "avg_latency_ms": avg_latency_ms,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
