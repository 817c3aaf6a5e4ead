/// Metrics collection for the proxy
use anyhow::Result;
use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::CacheStats;

/// Counters for a single backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendMetrics {
    /// Dispatches whose final outcome came from this backend
    pub requests: u64,
    /// Failed forwarding attempts, retries included
    pub failures: u64,
    /// Sum of recorded latencies in milliseconds
    pub latency_ms: u64,
}

impl BackendMetrics {
    /// Average latency per recorded request
    pub fn average_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.latency_ms as f64 / self.requests as f64
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests accepted by the dispatcher
    pub total_requests: u64,
    /// Forwarding retries performed
    pub total_retries: u64,
    /// Per-backend counters keyed by backend URL
    pub backends: BTreeMap<String, BackendMetrics>,
}

impl MetricsSnapshot {
    /// Calculate the share of forwarding attempts that failed
    pub fn failure_rate(&self) -> f64 {
        let failures: u64 = self.backends.values().map(|b| b.failures).sum();
        let attempts = self.total_requests + self.total_retries;
        if attempts == 0 {
            return 0.0;
        }
        (failures as f64 / attempts as f64) * 100.0
    }

    /// Calculate the share of requests that needed at least one retry
    pub fn retry_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.total_retries as f64 / self.total_requests as f64) * 100.0
    }
}

/// JSON document served on the metrics path: the raw snapshot plus derived
/// rates and cache occupancy
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    /// Percentage of forwarding attempts that failed
    pub failure_rate: f64,
    /// Retries per hundred requests
    pub retry_rate: f64,
    /// Average latency per backend in milliseconds
    pub average_latency_ms: BTreeMap<String, f64>,
    pub cache: CacheStats,
}

impl MetricsReport {
    pub fn new(snapshot: MetricsSnapshot, cache: CacheStats) -> Self {
        let average_latency_ms = snapshot
            .backends
            .iter()
            .map(|(url, backend)| (url.clone(), backend.average_latency_ms()))
            .collect();
        Self {
            failure_rate: snapshot.failure_rate(),
            retry_rate: snapshot.retry_rate(),
            average_latency_ms,
            cache,
            snapshot,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Metrics collector for the proxy
///
/// The authoritative counters live behind one mutex so a snapshot is a single
/// consistent instant. The prometheus registry mirrors them for scraping.
pub struct MetricsCollector {
    state: Mutex<MetricsSnapshot>,

    /// Prometheus registry
    registry: Registry,
    requests_total: IntCounter,
    retries_total: IntCounter,
    backend_requests_total: IntCounterVec,
    backend_failures_total: IntCounterVec,
    backend_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "junction_requests_total",
            "Total number of HTTP requests accepted by the proxy",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let retries_total = IntCounter::with_opts(Opts::new(
            "junction_retries_total",
            "Total number of forwarding retries",
        ))?;
        registry.register(Box::new(retries_total.clone()))?;

        let backend_requests_total = IntCounterVec::new(
            Opts::new(
                "junction_backend_requests_total",
                "Requests answered per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_failures_total = IntCounterVec::new(
            Opts::new(
                "junction_backend_failures_total",
                "Failed forwarding attempts per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_failures_total.clone()))?;

        let backend_duration = HistogramVec::new(
            HistogramOpts::new(
                "junction_backend_duration_seconds",
                "Backend response time in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["backend"],
        )?;
        registry.register(Box::new(backend_duration.clone()))?;

        Ok(Self {
            state: Mutex::new(MetricsSnapshot::default()),
            registry,
            requests_total,
            retries_total,
            backend_requests_total,
            backend_failures_total,
            backend_duration,
        })
    }

    /// Record a new request
    pub fn record_request(&self) {
        self.state.lock().total_requests += 1;
        self.requests_total.inc();
    }

    /// Record a forwarding retry
    pub fn record_retry(&self) {
        self.state.lock().total_retries += 1;
        self.retries_total.inc();
    }

    /// Record the backend that produced a request's final outcome
    pub fn record_backend_request(&self, backend: &str) {
        self.state
            .lock()
            .backends
            .entry(backend.to_string())
            .or_default()
            .requests += 1;
        self.backend_requests_total
            .with_label_values(&[backend])
            .inc();
    }

    /// Record a failed forwarding attempt
    pub fn record_backend_failure(&self, backend: &str) {
        self.state
            .lock()
            .backends
            .entry(backend.to_string())
            .or_default()
            .failures += 1;
        self.backend_failures_total
            .with_label_values(&[backend])
            .inc();
    }

    /// Add to a backend's accumulated latency
    pub fn record_backend_latency(&self, backend: &str, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        {
            let mut state = self.state.lock();
            let entry = state.backends.entry(backend.to_string()).or_default();
            entry.latency_ms = entry.latency_ms.saturating_add(millis);
        }
        self.backend_duration
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().clone()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        metrics.record_request();
        metrics.record_retry();
        metrics.record_backend_request("http://a:80");
        metrics.record_backend_failure("http://a:80");
        metrics.record_backend_latency("http://a:80", Duration::from_millis(40));
        metrics.record_backend_latency("http://a:80", Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.total_retries, 1);
        let a = &snapshot.backends["http://a:80"];
        assert_eq!(a.requests, 1);
        assert_eq!(a.failures, 1);
        assert_eq!(a.latency_ms, 60);
        assert_eq!(a.average_latency_ms(), 60.0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        let before = metrics.snapshot();
        metrics.record_request();
        assert_eq!(before.total_requests, 1);
        assert_eq!(metrics.snapshot().total_requests, 2);
    }

    #[test]
    fn test_report_json_shape() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        metrics.record_request();
        metrics.record_retry();
        metrics.record_backend_request("http://b:80");
        metrics.record_backend_request("http://b:80");
        metrics.record_backend_latency("http://b:80", Duration::from_millis(30));

        let cache = CacheStats {
            capacity_bytes: 1024,
            used_bytes: 100,
            entries: 2,
        };
        let report = MetricsReport::new(metrics.snapshot(), cache);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["total_requests"], 2);
        assert_eq!(json["total_retries"], 1);
        assert_eq!(json["backends"]["http://b:80"]["requests"], 2);
        assert_eq!(json["backends"]["http://b:80"]["latency_ms"], 30);
        assert_eq!(json["retry_rate"], 50.0);
        assert_eq!(json["failure_rate"], 0.0);
        assert_eq!(json["average_latency_ms"]["http://b:80"], 15.0);
        assert_eq!(json["cache"]["capacity_bytes"], 1024);
        assert_eq!(json["cache"]["used_bytes"], 100);
        assert_eq!(json["cache"]["entries"], 2);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        metrics.record_backend_failure("http://c:80");

        let text = metrics.export_metrics().unwrap();
        assert!(text.contains("junction_requests_total 1"));
        assert!(text.contains("junction_backend_failures_total{backend=\"http://c:80\"} 1"));
    }

    #[test]
    fn test_rates() {
        let snapshot = MetricsSnapshot::default();
        assert_eq!(snapshot.failure_rate(), 0.0);
        assert_eq!(snapshot.retry_rate(), 0.0);

        let mut snapshot = MetricsSnapshot {
            total_requests: 4,
            total_retries: 1,
            ..Default::default()
        };
        snapshot.backends.insert(
            "http://a:80".to_string(),
            BackendMetrics {
                requests: 4,
                failures: 1,
                latency_ms: 0,
            },
        );
        assert_eq!(snapshot.retry_rate(), 25.0);
        assert_eq!(snapshot.failure_rate(), 20.0);
    }

    #[test]
    fn test_concurrent_writers_keep_snapshots_consistent() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    let backend = format!("http://b{}:80", i % 2);
                    for _ in 0..1000 {
                        metrics.record_request();
                        metrics.record_backend_request(&backend);
                    }
                })
            })
            .collect();

        let reader = {
            let metrics = Arc::clone(&metrics);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = metrics.snapshot();
                    let per_backend: u64 = snapshot.backends.values().map(|b| b.requests).sum();
                    assert!(per_backend <= snapshot.total_requests);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4000);
        assert_eq!(snapshot.backends["http://b0:80"].requests, 2000);
        assert_eq!(snapshot.backends["http://b1:80"].requests, 2000);
    }
}
