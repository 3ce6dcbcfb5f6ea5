//! Engine lifecycle: builds every component once, runs the background loops
//! until the cancellation token fires, then flushes state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::ApiState;
use crate::collab::{
    DiscordNotifier, ErrorAlert, HeuristicModel, JsonProductParser, LogNotifier, MarketClient,
    MarketData, MemoryCache, NoCache, Notifier, Persistence, PredictionCache,
};
use crate::config::{Config, MAINTENANCE_INTERVAL_SECS, MARKET_USER_AGENT};
use crate::db::SqliteStore;
use crate::error::{AppError, Result};
use crate::http::{HeaderProfile, RequesterConfig, ResilientRequester};
use crate::monitor::{MonitorConfig, RestockScheduler};
use crate::proxy::ProxyMode;
use crate::queue::WorkQueue;
use crate::scanner::{DealPipeline, ScanConfig, ScanOrchestrator, ScanStats};
use crate::types::{ProductRecord, RunSummary};

pub struct Engine {
    cfg: Config,
    started: Instant,
    mode: ProxyMode,
    retail: Arc<ResilientRequester>,
    market: Arc<ResilientRequester>,
    store: SqliteStore,
    notifier: Arc<dyn Notifier>,
    scan_stats: Arc<ScanStats>,
    enrich_queue: Arc<WorkQueue<ProductRecord>>,
    orchestrator: Arc<ScanOrchestrator>,
    deals: Arc<DealPipeline>,
    scheduler: Arc<RestockScheduler>,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn build(cfg: Config) -> Result<Self> {
        let mode = ProxyMode::from_config(&cfg).await?;
        match mode.pool() {
            Some(pool) => info!(proxies = pool.len(), "Proxy pool loaded"),
            None => warn!("PROXY_FILE not set, sending every request directly"),
        }

        let store = SqliteStore::connect(&cfg.db_path).await?;
        let persistence: Arc<dyn Persistence> = Arc::new(store.clone());

        let retail = Arc::new(ResilientRequester::new(
            RequesterConfig::from_config(
                &cfg,
                Some(cfg.retail_base_url.clone()),
                HeaderProfile::Desktop,
            ),
            mode.clone(),
        ));
        let market = Arc::new(ResilientRequester::new(
            RequesterConfig::from_config(
                &cfg,
                Some(cfg.market_base_url.clone()),
                HeaderProfile::MobileApp {
                    user_agent: MARKET_USER_AGENT.to_string(),
                    auth_token: cfg.market_auth_token.clone(),
                    extra: Vec::new(),
                },
            ),
            mode.clone(),
        ));
        let market_data: Arc<dyn MarketData> = Arc::new(MarketClient::new(market.clone()));

        let notifier: Arc<dyn Notifier> = match &cfg.discord_webhook_url {
            Some(url) => Arc::new(
                DiscordNotifier::new(url.clone()).map_err(|e| AppError::Config(e.to_string()))?,
            ),
            None => {
                info!("DISCORD_WEBHOOK_URL not set, notifications go to the log");
                Arc::new(LogNotifier)
            }
        };
        let model = Arc::new(HeuristicModel);

        let scan_stats = Arc::new(ScanStats::new());
        let orchestrator = Arc::new(ScanOrchestrator::new(
            retail.clone(),
            Arc::new(JsonProductParser),
            ScanConfig::from_config(&cfg),
            scan_stats.clone(),
        ));

        let enrich_queue = Arc::new(WorkQueue::new("enrich", cfg.queue_capacity, cfg.queue_ttl));
        let deals = Arc::new(DealPipeline::new(
            enrich_queue.clone(),
            persistence.clone(),
            market_data.clone(),
            model.clone(),
            notifier.clone(),
            scan_stats.clone(),
            cfg.min_profit,
        ));

        let monitor_cfg = MonitorConfig::from_config(&cfg);
        let monitor_queue = Arc::new(WorkQueue::new(
            "monitor",
            cfg.queue_capacity,
            monitor_cfg.prediction_ttl,
        ));
        let cache: Arc<dyn PredictionCache> = if cfg.prediction_cache {
            Arc::new(MemoryCache::new())
        } else {
            info!("PREDICTION_CACHE disabled, predictions are recomputed on every admission");
            Arc::new(NoCache)
        };
        let scheduler = Arc::new(RestockScheduler::new(
            monitor_cfg,
            monitor_queue,
            persistence,
            cache,
            market_data,
            model,
            notifier.clone(),
        ));

        Ok(Self {
            cfg,
            started: Instant::now(),
            mode,
            retail,
            market,
            store,
            notifier,
            scan_stats,
            enrich_queue,
            orchestrator,
            deals,
            scheduler,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token starts a graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            started: self.started,
            mode: self.mode.clone(),
            scan_stats: self.scan_stats.clone(),
            retail: self.retail.clone(),
            market: self.market.clone(),
            enrich_queue: self.enrich_queue.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
        }
    }

    /// Runs every loop until the token is cancelled, then shuts down.
    pub async fn run(self) -> RunSummary {
        if let Err(e) = self.notifier.notify_startup().await {
            warn!("Startup notification failed: {e}");
        }
        info!(
            mode = self.mode.label(),
            candidates = self.cfg.candidate_urls.len(),
            "Engine running"
        );

        let deal_wake = Arc::new(Notify::new());
        let tasks = vec![
            tokio::spawn(scan_loop(
                self.orchestrator.clone(),
                self.deals.clone(),
                deal_wake.clone(),
                self.notifier.clone(),
                self.cfg.candidate_urls.clone(),
                self.cfg.scan_interval,
                self.cancel.clone(),
            )),
            tokio::spawn(deal_loop(self.deals.clone(), deal_wake, self.cancel.clone())),
            tokio::spawn({
                let scheduler = self.scheduler.clone();
                let cancel = self.cancel.clone();
                async move { scheduler.run(cancel).await }
            }),
            tokio::spawn(maintenance_loop(
                self.mode.clone(),
                self.scan_stats.clone(),
                self.retail.clone(),
                self.market.clone(),
                self.enrich_queue.clone(),
                self.scheduler.clone(),
                self.notifier.clone(),
                self.cancel.clone(),
            )),
        ];

        self.cancel.cancelled().await;
        info!("Shutdown requested, waiting for loops to finish");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Engine task failed: {e}");
            }
        }
        self.shutdown().await
    }

    async fn shutdown(&self) -> RunSummary {
        let mut abandoned = 0;
        for (name, keys) in [
            (
                "enrich",
                self.enrich_queue
                    .drain_all()
                    .into_iter()
                    .map(|i| i.key)
                    .collect::<Vec<_>>(),
            ),
            (
                "monitor",
                self.scheduler
                    .queue()
                    .drain_all()
                    .into_iter()
                    .map(|i| i.key)
                    .collect(),
            ),
        ] {
            for key in &keys {
                warn!(queue = name, key = %key, "Abandoning queued work item");
            }
            abandoned += keys.len();
        }

        if let (Some(pool), Some(path)) = (self.mode.pool(), &self.cfg.proxy_file) {
            match pool.save(path).await {
                Ok(()) => info!(path = %path, proxies = pool.len(), "Proxy list saved"),
                Err(e) => error!(path = %path, "Saving proxy list failed: {e}"),
            }
        }

        let scan = self.scan_stats.snapshot();
        let summary = RunSummary {
            uptime_secs: self.started.elapsed().as_secs(),
            scans: scan.scans,
            products_found: scan.products_found,
            deals_found: scan.deals_found,
            restocks_found: self.scheduler.stats().restocks,
            abandoned_items: abandoned,
        };
        if let Err(e) = self.notifier.notify_shutdown(&summary).await {
            warn!("Shutdown notification failed: {e}");
        }
        info!(?summary, "Engine stopped");
        summary
    }
}

/// Raises `alert` while `failing` holds and clears it once it does not.
async fn track_failure(alert: &ErrorAlert, notifier: &dyn Notifier, failing: bool, message: &str) {
    if failing {
        alert.raise(notifier, message).await;
    } else {
        alert.clear();
    }
}

async fn scan_loop(
    orchestrator: Arc<ScanOrchestrator>,
    deals: Arc<DealPipeline>,
    deal_wake: Arc<Notify>,
    notifier: Arc<dyn Notifier>,
    candidates: Vec<String>,
    every: Duration,
    cancel: CancellationToken,
) {
    if candidates.is_empty() {
        warn!("CANDIDATE_URLS is empty, scan loop idle");
        cancel.cancelled().await;
        return;
    }
    let pool_alert = ErrorAlert::new();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let started = Instant::now();
        let exhausted_before = orchestrator.stats().snapshot().pool_exhausted;
        let records = orchestrator.scan(&candidates, &cancel).await;
        let exhausted = orchestrator.stats().snapshot().pool_exhausted - exhausted_before;
        track_failure(
            &pool_alert,
            notifier.as_ref(),
            exhausted > 0,
            &format!("Scan dropped {exhausted} candidates: every proxy is blacklisted"),
        )
        .await;
        let queued = deals.ingest(&records).await;
        info!(
            pages = records.len(),
            candidates = candidates.len(),
            queued,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan finished"
        );
        if queued > 0 {
            deal_wake.notify_one();
        }
    }
    info!("Scan loop stopped");
}

async fn deal_loop(deals: Arc<DealPipeline>, wake: Arc<Notify>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
        }
        let found = deals.drain(&cancel).await;
        if found > 0 {
            info!(deals = found, "Enrichment pass finished");
        }
    }
    info!("Deal loop stopped");
}

/// Expiry sweep for the enrichment queue plus a periodic performance log.
/// The monitor queue is swept by the scheduler itself so its active set
/// stays in step.
async fn maintenance_loop(
    mode: ProxyMode,
    scan_stats: Arc<ScanStats>,
    retail: Arc<ResilientRequester>,
    market: Arc<ResilientRequester>,
    enrich_queue: Arc<WorkQueue<ProductRecord>>,
    scheduler: Arc<RestockScheduler>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    let pool_alert = ErrorAlert::new();
    let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    interval.tick().await; // consume immediate first tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let expired = enrich_queue.sweep_expired();
        if !expired.is_empty() {
            warn!(dropped = expired.len(), "Expired enrichment items dropped");
        }

        let scan = scan_stats.snapshot();
        info!(
            scans = scan.scans,
            ok = scan.items_ok,
            failed = scan.items_failed,
            success_rate = scan.success_rate.unwrap_or(0.0),
            p50_ms = scan.p50_ms.unwrap_or(0),
            p95_ms = scan.p95_ms.unwrap_or(0),
            p99_ms = scan.p99_ms.unwrap_or(0),
            "[PERF] scanner"
        );
        for (name, requester) in [("retail", &retail), ("market", &market)] {
            let r = requester.stats().snapshot();
            info!(
                client = name,
                attempts = r.attempts,
                successes = r.successes,
                target_limited = r.target_limited,
                transport_errors = r.transport_errors,
                exhausted = r.exhausted,
                delay_ms = requester.pacer().current_delay().as_millis() as u64,
                avg_latency_ms = requester
                    .pacer()
                    .average_latency()
                    .map_or(0, |d| d.as_millis() as u64),
                "[PERF] requests"
            );
        }
        if let Some(pool) = mode.pool() {
            let m = pool.metrics();
            info!(
                total = m.total,
                active = m.active,
                blacklisted = m.blacklisted,
                avg_score = m.avg_score,
                "[PERF] proxies"
            );
            if m.active == 0 {
                warn!("Every proxy is blacklisted; requests will fail until one revalidates");
            }
            track_failure(
                &pool_alert,
                notifier.as_ref(),
                m.active == 0,
                &format!("All {} proxies are blacklisted", m.total),
            )
            .await;
        }
        let eq = enrich_queue.stats();
        let mq = scheduler.queue().stats();
        let monitor = scheduler.stats();
        info!(
            enrich_queued = eq.queued,
            enrich_in_flight = eq.in_flight,
            monitor_queued = mq.queued,
            monitor_in_flight = mq.in_flight,
            active_monitors = monitor.active,
            restocks = monitor.restocks,
            "[PERF] queues"
        );
    }
    info!("Maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::fakes::RecordingNotifier;
    use crate::config::test_config;
    use crate::queue::WorkItem;

    fn temp_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("restock-engine-{name}-{nanos}"))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn runs_and_shuts_down_in_direct_mode() {
        let mut cfg = test_config();
        cfg.db_path = temp_path("direct.db");
        let engine = Engine::build(cfg.clone()).await.unwrap();
        assert_eq!(engine.api_state().mode.label(), "direct");

        engine.enrich_queue.push(WorkItem::new(
            "left-behind",
            1,
            ProductRecord {
                sku: "left-behind".into(),
                brand: "Nike".into(),
                model: "Dunk".into(),
                price: 100.0,
                url: String::new(),
            },
        ));

        let cancel = engine.cancel_token();
        let task = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.abandoned_items, 1);
        assert_eq!(summary.scans, 0);
        let _ = std::fs::remove_file(&cfg.db_path);
    }

    #[tokio::test]
    async fn pooled_mode_saves_proxy_list_on_shutdown() {
        let proxy_file = temp_path("proxies.txt");
        std::fs::write(&proxy_file, "10.0.0.2:8080\n10.0.0.1:8080\n10.0.0.1:8080\n").unwrap();
        let mut cfg = test_config();
        cfg.db_path = temp_path("pooled.db");
        cfg.proxy_file = Some(proxy_file.clone());

        let engine = Engine::build(cfg.clone()).await.unwrap();
        assert_eq!(engine.mode.pool().map(|p| p.len()), Some(2));
        let cancel = engine.cancel_token();
        cancel.cancel();
        engine.run().await;

        let saved = std::fs::read_to_string(&proxy_file).unwrap();
        assert_eq!(saved.lines().collect::<Vec<_>>(), vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
        let _ = std::fs::remove_file(&proxy_file);
        let _ = std::fs::remove_file(&cfg.db_path);
    }

    #[tokio::test]
    async fn failure_alert_fires_once_per_outage() {
        let notifier = RecordingNotifier::default();
        let alert = ErrorAlert::new();
        for failing in [true, true, false, false, true, true] {
            track_failure(&alert, &notifier, failing, "All 2 proxies are blacklisted").await;
        }
        let errors = notifier.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e == "All 2 proxies are blacklisted"));
    }

    #[tokio::test]
    async fn empty_proxy_file_is_rejected() {
        let proxy_file = temp_path("empty.txt");
        std::fs::write(&proxy_file, "# nothing here\n").unwrap();
        let mut cfg = test_config();
        cfg.db_path = temp_path("empty.db");
        cfg.proxy_file = Some(proxy_file.clone());
        assert!(matches!(
            Engine::build(cfg).await,
            Err(AppError::ProxyList(_))
        ));
        let _ = std::fs::remove_file(&proxy_file);
    }
}
