//! Latency histograms and counters for translated requests.
//! Histograms track p50/p95/p99 over a fixed ring of recent samples.
//! Fed out-of-band by the telemetry consumer, never by the hot path.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::telemetry::{TelemetrySink, TranslationEvent};
use crate::translate::TierHit;

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        let idx = idx.min(self.count - 1);
        sorted[idx]
    }
}

/// Named histograms (milliseconds) and monotonic counters.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Record a sample (in milliseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_ms: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_ms);
    }

    pub fn incr(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Get percentile for a metric (p value 0-100). Returns milliseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// Every histogram at p50/p95/p99 plus all counters.
    pub fn summary(&self) -> MetricsSummary {
        let hists = self.histograms.lock();
        let latencies = hists
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    LatencySummary {
                        p50_ms: ring.percentile(50.0),
                        p95_ms: ring.percentile(95.0),
                        p99_ms: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect();
        drop(hists);
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(&name, &v)| (name.to_string(), v))
            .collect();
        MetricsSummary { latencies, counters }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LatencySummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSummary {
    pub latencies: BTreeMap<String, LatencySummary>,
    pub counters: BTreeMap<String, u64>,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    pub const TRANSLATE_LATENCY: &str = "translate_latency_ms";
    pub const HIT_USER_SUBMITTED: &str = "hit_user_submitted_ms";
    pub const HIT_PRIORITY: &str = "hit_priority_ms";
    pub const HIT_GENERAL: &str = "hit_general_ms";
    pub const MISS: &str = "miss_ms";

    pub const REQUESTS: &str = "requests";
    pub const CACHE_HITS: &str = "cache_hits";
    pub const PROVIDER_MISSES: &str = "provider_misses";
    pub const DEDUPED: &str = "deduped";
    pub const FAILURES: &str = "failures";
}

/// Telemetry sink that feeds the registry.
pub struct MetricsSink {
    registry: std::sync::Arc<MetricsRegistry>,
}

impl MetricsSink {
    pub fn new(registry: std::sync::Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

impl TelemetrySink for MetricsSink {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn consume(&self, batch: &[TranslationEvent]) {
        use metric_names::*;
        for event in batch {
            self.registry.incr(REQUESTS);
            self.registry.record(TRANSLATE_LATENCY, event.latency_ms);
            if event.cached {
                self.registry.incr(CACHE_HITS);
            }
            if event.deduped {
                self.registry.incr(DEDUPED);
            }
            if !event.success {
                self.registry.incr(FAILURES);
            }
            let by_tier = match event.tier_hit {
                TierHit::UserSubmitted => Some(HIT_USER_SUBMITTED),
                TierHit::Priority => Some(HIT_PRIORITY),
                TierHit::General => Some(HIT_GENERAL),
                TierHit::Miss if event.success => {
                    self.registry.incr(PROVIDER_MISSES);
                    Some(MISS)
                }
                _ => None,
            };
            if let Some(name) = by_tier {
                self.registry.record(name, event.latency_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_ring() {
        let registry = MetricsRegistry::with_capacity(100);
        for v in 1..=100 {
            registry.record(metric_names::TRANSLATE_LATENCY, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::TRANSLATE_LATENCY, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::TRANSLATE_LATENCY, 99.0), 99.0);
        assert_eq!(registry.percentile("unknown", 50.0), 0.0);
    }

    #[test]
    fn ring_keeps_only_recent_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [1000.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(metric_names::MISS, v);
        }
        let summary = registry.summary();
        let miss = &summary.latencies[metric_names::MISS];
        assert_eq!(miss.count, 4);
        assert_eq!(miss.p99_ms, 4.0);
    }

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.incr(metric_names::REQUESTS);
        registry.incr(metric_names::REQUESTS);
        assert_eq!(registry.counter(metric_names::REQUESTS), 2);
        assert_eq!(registry.summary().counters["requests"], 2);
    }
}
