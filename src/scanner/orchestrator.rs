//! Batched, bounded-concurrency fetch of candidate listing pages.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::PageParser;
use crate::config::{Config, SCAN_BATCH_PAUSE_MS, SCAN_ITEM_RETRY_BASE_MS};
use crate::error::RequestFailure;
use crate::http::ResilientRequester;
use crate::scanner::stats::ScanStats;
use crate::types::ProductRecord;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Attempts per candidate before it is dropped.
    pub item_retries: u32,
    pub retry_base: Duration,
    pub batch_pause: Duration,
}

impl ScanConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.scan_batch_size.max(1),
            concurrency: cfg.scan_concurrency.max(1),
            item_retries: cfg.scan_item_retries.max(1),
            retry_base: Duration::from_millis(SCAN_ITEM_RETRY_BASE_MS),
            batch_pause: Duration::from_millis(SCAN_BATCH_PAUSE_MS),
        }
    }
}

/// One successfully fetched candidate.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub url: String,
    pub products: Vec<ProductRecord>,
    pub latency: Duration,
}

pub struct ScanOrchestrator {
    requester: Arc<ResilientRequester>,
    parser: Arc<dyn PageParser>,
    cfg: ScanConfig,
    permits: Arc<Semaphore>,
    stats: Arc<ScanStats>,
}

impl ScanOrchestrator {
    pub fn new(
        requester: Arc<ResilientRequester>,
        parser: Arc<dyn PageParser>,
        cfg: ScanConfig,
        stats: Arc<ScanStats>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.concurrency));
        Self {
            requester,
            parser,
            cfg,
            permits,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ScanStats> {
        &self.stats
    }

    /// Fetches every candidate and returns the ones that succeeded. Failing
    /// candidates are dropped, so the result may be shorter than the input.
    /// Stops between batches once `cancel` fires.
    pub async fn scan(&self, candidates: &[String], cancel: &CancellationToken) -> Vec<ScanRecord> {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        let batches = candidates.len().div_ceil(self.cfg.batch_size);
        let mut records = Vec::with_capacity(candidates.len());

        for (idx, batch) in candidates.chunks(self.cfg.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!("Scan cancelled after {idx} of {batches} batches");
                break;
            }

            let results = join_all(batch.iter().map(|url| self.scan_one(url))).await;
            let before = records.len();
            records.extend(results.into_iter().flatten());
            debug!(
                batch = idx + 1,
                batches,
                ok = records.len() - before,
                failed = batch.len() - (records.len() - before),
                "Scan batch finished"
            );

            if idx + 1 < batches {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.cfg.batch_pause) => {}
                }
            }
        }

        info!(
            "Scan complete: {}/{} candidates fetched, {} products",
            records.len(),
            candidates.len(),
            records.iter().map(|r| r.products.len()).sum::<usize>()
        );
        records
    }

    async fn scan_one(&self, url: &str) -> Option<ScanRecord> {
        for attempt in 0..self.cfg.item_retries {
            let result = {
                let Ok(_permit) = self.permits.acquire().await else {
                    return None;
                };
                self.requester.get(url, &[]).await
            };

            match result {
                Ok(resp) => {
                    let products = self.parser.parse(&resp.payload);
                    debug!(
                        url,
                        status = resp.status,
                        proxy = resp.proxy.as_deref().unwrap_or("direct"),
                        products = products.len(),
                        "Candidate fetched"
                    );
                    self.stats.record_success(resp.latency, products.len());
                    return Some(ScanRecord {
                        url: url.to_string(),
                        products,
                        latency: resp.latency,
                    });
                }
                Err(RequestFailure::PoolExhausted) => {
                    self.stats.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(url, attempt = attempt + 1, "Dropping candidate: no usable proxy");
                    break;
                }
                Err(e @ RequestFailure::InvalidRequest(_)) => {
                    warn!(url, attempt = attempt + 1, "Dropping candidate: {e}");
                    break;
                }
                Err(e) => {
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max = self.cfg.item_retries,
                        "Candidate fetch failed: {e}"
                    );
                    if attempt + 1 < self.cfg.item_retries {
                        self.stats.item_retries.fetch_add(1, Ordering::Relaxed);
                        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                        tokio::time::sleep(self.cfg.retry_base.saturating_mul(multiplier)).await;
                    }
                }
            }
        }
        self.stats.record_failure();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::JsonProductParser;
    use crate::http::backoff::BackoffPolicy;
    use crate::http::{HeaderProfile, RequesterConfig};
    use crate::proxy::ProxyMode;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn listing_server(in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/page/:id",
            get(move |Path(id): Path<u32>| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if id % 5 == 4 {
                        return StatusCode::NOT_FOUND.into_response();
                    }
                    Json(json!([{ "sku": format!("SKU-{id}"), "price": 100.0 + id as f64 }]))
                        .into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn orchestrator(base: String, concurrency: usize, batch_size: usize) -> ScanOrchestrator {
        let requester = ResilientRequester::new(
            RequesterConfig {
                base_url: Some(base),
                profile: HeaderProfile::Desktop,
                timeout: Duration::from_secs(5),
                min_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff: BackoffPolicy::new(Duration::from_millis(10)),
                max_retries: Some(1),
                session_lifetime: Duration::from_secs(60),
                session_max_requests: 1000,
            },
            ProxyMode::Direct,
        );
        ScanOrchestrator::new(
            Arc::new(requester),
            Arc::new(JsonProductParser),
            ScanConfig {
                batch_size,
                concurrency,
                item_retries: 2,
                retry_base: Duration::from_millis(5),
                batch_pause: Duration::from_millis(10),
            },
            Arc::new(ScanStats::new()),
        )
    }

    #[tokio::test]
    async fn drops_failing_candidates_and_respects_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let base = listing_server(in_flight, peak.clone()).await;
        let scanner = orchestrator(base, 3, 10);

        let candidates: Vec<String> = (0..20).map(|i| format!("/page/{i}")).collect();
        let records = scanner.scan(&candidates, &CancellationToken::new()).await;

        // Every fifth page 404s on each attempt.
        assert_eq!(records.len(), 16);
        assert!(records.iter().all(|r| r.products.len() == 1));
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));

        let snap = scanner.stats().snapshot();
        assert_eq!(snap.items_ok, 16);
        assert_eq!(snap.items_failed, 4);
        assert_eq!(snap.item_retries, 4);
        assert_eq!(snap.products_found, 16);
    }

    #[tokio::test]
    async fn exhausted_pool_drops_candidates_without_retrying() {
        use crate::proxy::list::parse_line;
        use crate::proxy::ProxyPool;
        use crate::types::FailureKind;

        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            format!("127.0.0.1:{port}")
        };
        let pool = ProxyPool::new(vec![parse_line(&dead).unwrap()], format!("http://{dead}/"));
        for _ in 0..3 {
            pool.report_failure(&dead, FailureKind::ProxyLocal);
        }
        let requester = ResilientRequester::new(
            RequesterConfig {
                base_url: Some("http://shop.test".into()),
                profile: HeaderProfile::Desktop,
                timeout: Duration::from_secs(2),
                min_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff: BackoffPolicy::new(Duration::from_millis(10)),
                max_retries: None,
                session_lifetime: Duration::from_secs(60),
                session_max_requests: 1000,
            },
            ProxyMode::Pooled(pool),
        );
        let stats = Arc::new(ScanStats::new());
        let scanner = ScanOrchestrator::new(
            Arc::new(requester),
            Arc::new(JsonProductParser),
            ScanConfig {
                batch_size: 10,
                concurrency: 2,
                item_retries: 3,
                retry_base: Duration::from_millis(5),
                batch_pause: Duration::ZERO,
            },
            stats.clone(),
        );

        let candidates = vec!["/a".to_string(), "/b".to_string()];
        assert!(scanner.scan(&candidates, &CancellationToken::new()).await.is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.pool_exhausted, 2);
        assert_eq!(snap.items_failed, 2);
        assert_eq!(snap.item_retries, 0);
    }

    #[tokio::test]
    async fn cancelled_scan_stops_between_batches() {
        let base = listing_server(Arc::default(), Arc::default()).await;
        let scanner = orchestrator(base, 5, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let candidates: Vec<String> = (0..4).map(|i| format!("/page/{i}")).collect();
        assert!(scanner.scan(&candidates, &cancel).await.is_empty());
    }
}
