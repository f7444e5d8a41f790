//! Daemon metrics: counters, gauges, and streaming latency percentiles
//!
//! One container struct constructed by the daemon root and borrowed by every
//! handler. Rendered two ways: JSON for `/metrics` and Prometheus text for
//! `/metrics?format=prom` (all names prefixed `sgn_`).

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const WINDOW_CAP: usize = 512;

/// Rolling-window latency percentile estimator
pub struct LatencyWindow {
    samples: Mutex<VecDeque<f64>>,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW_CAP)),
        }
    }

    /// Record one sample in milliseconds
    pub fn record(&self, ms: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == WINDOW_CAP {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    /// Record the elapsed time of a started timer
    pub fn record_since(&self, started: Instant) {
        self.record(started.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Quantile over the current window; 0.0 when empty
    pub fn quantile(&self, q: f64) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
        sorted[idx]
    }

    pub fn p50(&self) -> f64 {
        self.quantile(0.50)
    }

    pub fn p95(&self) -> f64 {
        self.quantile(0.95)
    }
}

/// Metrics container
pub struct Metrics {
    pub http_publish_count: AtomicU64,
    pub http_verify_count: AtomicU64,
    pub net_delivered: AtomicU64,
    pub net_acked: AtomicU64,
    pub kus_deduplicated_total: AtomicU64,
    pub db_ku_stored_total: AtomicU64,
    pub outbox_queue_len: AtomicU64,
    pub ws_clients: AtomicU64,

    pub http_publish: LatencyWindow,
    pub http_verify: LatencyWindow,
    pub db_read: LatencyWindow,
    pub db_write: LatencyWindow,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            http_publish_count: AtomicU64::new(0),
            http_verify_count: AtomicU64::new(0),
            net_delivered: AtomicU64::new(0),
            net_acked: AtomicU64::new(0),
            kus_deduplicated_total: AtomicU64::new(0),
            db_ku_stored_total: AtomicU64::new(0),
            outbox_queue_len: AtomicU64::new(0),
            ws_clients: AtomicU64::new(0),
            http_publish: LatencyWindow::new(),
            http_verify: LatencyWindow::new(),
            db_read: LatencyWindow::new(),
            db_write: LatencyWindow::new(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    fn counters(&self) -> [(&'static str, u64); 6] {
        [
            ("http_publish_count", self.http_publish_count.load(Ordering::Relaxed)),
            ("http_verify_count", self.http_verify_count.load(Ordering::Relaxed)),
            ("net_delivered", self.net_delivered.load(Ordering::Relaxed)),
            ("net_acked", self.net_acked.load(Ordering::Relaxed)),
            (
                "kus_deduplicated_total",
                self.kus_deduplicated_total.load(Ordering::Relaxed),
            ),
            ("db_ku_stored_total", self.db_ku_stored_total.load(Ordering::Relaxed)),
        ]
    }

    fn gauges(&self) -> [(&'static str, u64); 2] {
        [
            ("outbox_queue_len", self.outbox_queue_len.load(Ordering::Relaxed)),
            ("ws_clients", self.ws_clients.load(Ordering::Relaxed)),
        ]
    }

    fn windows(&self) -> [(&'static str, &LatencyWindow); 4] {
        [
            ("http_publish", &self.http_publish),
            ("http_verify", &self.http_verify),
            ("db_read", &self.db_read),
            ("db_write", &self.db_write),
        ]
    }

    /// JSON rendering for `/metrics`
    pub fn render_json(&self) -> Value {
        let mut counters = serde_json::Map::new();
        for (name, value) in self.counters() {
            counters.insert(name.to_string(), json!(value));
        }
        for (name, value) in self.gauges() {
            counters.insert(name.to_string(), json!(value));
        }

        let mut latency = serde_json::Map::new();
        for (name, window) in self.windows() {
            latency.insert(
                name.to_string(),
                json!({
                    "p50_ms": window.p50(),
                    "p95_ms": window.p95(),
                    "count": window.count(),
                }),
            );
        }

        json!({
            "counters": counters,
            "latency": latency,
        })
    }

    /// Prometheus text exposition for `/metrics?format=prom`
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        for (name, value) in self.counters() {
            let _ = writeln!(out, "# TYPE sgn_{name} counter");
            let _ = writeln!(out, "sgn_{name} {value}");
        }
        for (name, value) in self.gauges() {
            let _ = writeln!(out, "# TYPE sgn_{name} gauge");
            let _ = writeln!(out, "sgn_{name} {value}");
        }
        for (name, window) in self.windows() {
            let _ = writeln!(out, "# TYPE sgn_{name}_ms summary");
            let _ = writeln!(out, "sgn_{name}_ms{{quantile=\"0.5\"}} {}", window.p50());
            let _ = writeln!(out, "sgn_{name}_ms{{quantile=\"0.95\"}} {}", window.p95());
            let _ = writeln!(out, "sgn_{name}_ms_count {}", window.count());
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
