use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};

/// Write-only metrics surface consumed by every component of the core.
///
/// Called on every admission decision, spill transition, drop, circuit
/// breaker state change, and batch adjustment. The buffering core never
/// reads metrics back.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], n: u64);
    fn set_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// No-op sink for callers that do not export metrics.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)], _n: u64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn record_histogram(&self, _name: &str, _value: f64) {}
}

#[derive(Debug, Default)]
struct HistogramState {
    count: u64,
    sum: f64,
}

/// In-process sink backed by atomics, suitable as a default and for tests.
#[derive(Debug, Default)]
pub struct AtomicMetricsSink {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>, // f64 bits
    histograms: RwLock<HashMap<String, HistogramState>>,
}

impl AtomicMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let mut key = String::with_capacity(name.len() + 16);
        key.push_str(name);
        for (k, v) in labels {
            key.push(':');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counter_value_with(name, &[])
    }

    pub fn counter_value_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = Self::label_key(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .read()
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    pub fn histogram_mean(&self, name: &str) -> Option<f64> {
        let histograms = self.histograms.read();
        let state = histograms.get(name)?;
        if state.count == 0 {
            return None;
        }
        Some(state.sum / state.count as f64)
    }
}

impl MetricsSink for AtomicMetricsSink {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = Self::label_key(name, labels);
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        {
            let gauges = self.gauges.read();
            if let Some(gauge) = gauges.get(name) {
                gauge.store(value.to_bits(), Ordering::Relaxed);
                return;
            }
        }
        let mut gauges = self.gauges.write();
        gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write();
        let state = histograms.entry(name.to_string()).or_default();
        state.count += 1;
        state.sum += value;
    }
}

/// Prometheus-backed sink. Metric families are registered lazily on
/// first use; label names are taken from the first observation of a
/// counter family and must stay stable afterwards.
#[cfg(feature = "metrics")]
pub struct PrometheusSink {
    registry: Registry,
    counters: RwLock<HashMap<String, CounterVec>>,
    gauges: RwLock<HashMap<String, GaugeVec>>,
    histograms: RwLock<HashMap<String, HistogramVec>>,
}

#[cfg(feature = "metrics")]
impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        encoder.encode(&self.registry.gather(), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn counter_family(&self, name: &str, label_keys: &[&str]) -> Option<CounterVec> {
        {
            let counters = self.counters.read();
            if let Some(family) = counters.get(name) {
                return Some(family.clone());
            }
        }
        let family =
            CounterVec::new(Opts::new(name, format!("{name} (auto-registered)")), label_keys)
                .ok()?;
        if self.registry.register(Box::new(family.clone())).is_err() {
            return self.counters.read().get(name).cloned();
        }
        self.counters
            .write()
            .insert(name.to_string(), family.clone());
        Some(family)
    }
}

#[cfg(feature = "metrics")]
impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
impl MetricsSink for PrometheusSink {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let keys: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        if let Some(family) = self.counter_family(name, &keys) {
            if let Ok(counter) = family.get_metric_with_label_values(&values) {
                counter.inc_by(n as f64);
            }
        }
    }

    fn set_gauge(&self, name: &str, value: f64) {
        let family = {
            let gauges = self.gauges.read();
            gauges.get(name).cloned()
        };
        let family = match family {
            Some(family) => family,
            None => {
                let Ok(family) =
                    GaugeVec::new(Opts::new(name, format!("{name} (auto-registered)")), &[])
                else {
                    return;
                };
                if self.registry.register(Box::new(family.clone())).is_ok() {
                    self.gauges.write().insert(name.to_string(), family.clone());
                    family
                } else {
                    match self.gauges.read().get(name).cloned() {
                        Some(existing) => existing,
                        None => return,
                    }
                }
            }
        };
        if let Ok(gauge) = family.get_metric_with_label_values(&[] as &[&str]) {
            gauge.set(value);
        }
    }

    fn record_histogram(&self, name: &str, value: f64) {
        let family = {
            let histograms = self.histograms.read();
            histograms.get(name).cloned()
        };
        let family = match family {
            Some(family) => family,
            None => {
                let Ok(family) = HistogramVec::new(
                    prometheus::HistogramOpts::new(name, format!("{name} (auto-registered)")),
                    &[],
                ) else {
                    return;
                };
                if self.registry.register(Box::new(family.clone())).is_ok() {
                    self.histograms
                        .write()
                        .insert(name.to_string(), family.clone());
                    family
                } else {
                    match self.histograms.read().get(name).cloned() {
                        Some(existing) => existing,
                        None => return,
                    }
                }
            }
        };
        if let Ok(histogram) = family.get_metric_with_label_values(&[] as &[&str]) {
            histogram.observe(value);
        }
    }
}
