//! Running scan statistics. Observability only; nothing reads these to
//! make decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Request latency histogram in milliseconds. Tracks 1ms to 10min.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1);
        if let Ok(mut h) = self.inner.lock() {
            h.saturating_record(ms);
        }
    }

    /// (p50, p95, p99) in milliseconds, `None` before the first sample.
    pub fn percentiles(&self) -> Option<(u64, u64, u64)> {
        let h = self.inner.lock().ok()?;
        if h.len() == 0 {
            return None;
        }
        Some((
            h.value_at_quantile(0.5),
            h.value_at_quantile(0.95),
            h.value_at_quantile(0.99),
        ))
    }

    pub fn mean_ms(&self) -> Option<f64> {
        let h = self.inner.lock().ok()?;
        (h.len() > 0).then(|| h.mean())
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ScanStats {
    pub scans: AtomicU64,
    pub items_ok: AtomicU64,
    pub items_failed: AtomicU64,
    pub item_retries: AtomicU64,
    pub products_found: AtomicU64,
    pub deals_found: AtomicU64,
    /// Candidates dropped because no proxy was usable.
    pub pool_exhausted: AtomicU64,
    pub latency: LatencyStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatsSnapshot {
    pub scans: u64,
    pub items_ok: u64,
    pub items_failed: u64,
    pub item_retries: u64,
    pub products_found: u64,
    pub deals_found: u64,
    pub pool_exhausted: u64,
    pub success_rate: Option<f64>,
    pub latency_samples: u64,
    pub avg_latency_ms: Option<f64>,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration, products: usize) {
        self.items_ok.fetch_add(1, Ordering::Relaxed);
        self.products_found
            .fetch_add(products as u64, Ordering::Relaxed);
        self.latency.record(latency);
    }

    pub fn record_failure(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanStatsSnapshot {
        let ok = self.items_ok.load(Ordering::Relaxed);
        let failed = self.items_failed.load(Ordering::Relaxed);
        let total = ok + failed;
        let pct = self.latency.percentiles();
        ScanStatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            items_ok: ok,
            items_failed: failed,
            item_retries: self.item_retries.load(Ordering::Relaxed),
            products_found: self.products_found.load(Ordering::Relaxed),
            deals_found: self.deals_found.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            success_rate: (total > 0).then(|| ok as f64 / total as f64),
            latency_samples: self.latency.len(),
            avg_latency_ms: self.latency.mean_ms(),
            p50_ms: pct.map(|p| p.0),
            p95_ms: pct.map(|p| p.1),
            p99_ms: pct.map(|p| p.2),
        }
    }
}
