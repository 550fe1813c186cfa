//! Management Statistics
//!
//! Counters and latency histograms kept in a private
//! [`prometheus::Registry`], so several caches in one process never clash
//! on metric names.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;

const LATENCY_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
];

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub removes: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
    pub average_read_time: Duration,
    pub average_write_time: Duration,
    pub since: DateTime<Utc>,
}

/// Statistics recorded by the management interceptor
pub struct CacheStatistics {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    stores: IntCounter,
    removes: IntCounter,
    evictions: IntCounter,
    latency: HistogramVec,
    since: RwLock<DateTime<Utc>>,
}

impl CacheStatistics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("treecache".to_string()), None)?;

        let hits = IntCounter::with_opts(Opts::new("hits_total", "Reads that found data"))?;
        let misses = IntCounter::with_opts(Opts::new("misses_total", "Reads that found nothing"))?;
        let stores = IntCounter::with_opts(Opts::new("stores_total", "Successful writes"))?;
        let removes = IntCounter::with_opts(Opts::new("removes_total", "Successful removals"))?;
        let evictions = IntCounter::with_opts(Opts::new("evictions_total", "Evict invocations"))?;
        let latency = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Invocation latency").buckets(LATENCY_BUCKETS.to_vec()),
            &["kind"],
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(stores.clone()))?;
        registry.register(Box::new(removes.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            stores,
            removes,
            evictions,
            latency,
            since: RwLock::new(Utc::now()),
        })
    }

    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.inc();
        self.observe("read", elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.inc();
        self.observe("read", elapsed);
    }

    pub fn record_store(&self, elapsed: Duration) {
        self.stores.inc();
        self.observe("write", elapsed);
    }

    pub fn record_remove(&self, elapsed: Duration) {
        self.removes.inc();
        self.observe("write", elapsed);
    }

    pub fn record_eviction(&self) {
        self.evictions.inc();
    }

    fn observe(&self, kind: &str, elapsed: Duration) {
        self.latency.with_label_values(&[kind]).observe(elapsed.as_secs_f64());
    }

    fn average(&self, kind: &str) -> Duration {
        let histogram = self.latency.with_label_values(&[kind]);
        let count = histogram.get_sample_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(histogram.get_sample_sum() / count as f64)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let hits = self.hits.get();
        let misses = self.misses.get();
        let reads = hits + misses;
        StatisticsSnapshot {
            hits,
            misses,
            stores: self.stores.get(),
            removes: self.removes.get(),
            evictions: self.evictions.get(),
            hit_ratio: if reads == 0 { 0.0 } else { hits as f64 / reads as f64 },
            average_read_time: self.average("read"),
            average_write_time: self.average("write"),
            since: *self.since.read(),
        }
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn reset(&self) {
        self.hits.reset();
        self.misses.reset();
        self.stores.reset();
        self.removes.reset();
        self.evictions.reset();
        self.latency.reset();
        *self.since.write() = Utc::now();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for CacheStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStatistics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_ratio() {
        let stats = CacheStatistics::new().unwrap();
        stats.record_hit(Duration::from_micros(10));
        stats.record_hit(Duration::from_micros(30));
        stats.record_miss(Duration::from_micros(20));
        stats.record_store(Duration::from_millis(1));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.stores, 1);
        assert!((snapshot.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!(snapshot.average_read_time > Duration::ZERO);
    }

    #[test]
    fn test_render_and_reset() {
        let stats = CacheStatistics::new().unwrap();
        stats.record_eviction();
        stats.record_remove(Duration::from_micros(5));

        let text = stats.render().unwrap();
        assert!(text.contains("treecache_evictions_total 1"));
        assert!(text.contains("treecache_operation_duration_seconds"));

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.removes, 0);
        assert_eq!(snapshot.average_write_time, Duration::ZERO);
    }

    #[test]
    fn test_independent_registries() {
        let a = CacheStatistics::new().unwrap();
        let b = CacheStatistics::new().unwrap();
        a.record_eviction();
        assert_eq!(b.snapshot().evictions, 0);
    }
}
