use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::health;
use crate::db::models::{DealRow, RestockRow};
use crate::db::SqliteStore;
use crate::error::AppError;
use crate::http::requester::RequestStatsSnapshot;
use crate::http::ResilientRequester;
use crate::monitor::{MonitorStatsSnapshot, MonitorView, RestockScheduler};
use crate::proxy::pool::ProxyView;
use crate::proxy::{PoolMetrics, ProxyMode};
use crate::queue::{QueueStats, WorkQueue};
use crate::scanner::stats::ScanStatsSnapshot;
use crate::scanner::ScanStats;
use crate::types::ProductRecord;

const DEFAULT_RECENT_LIMIT: i64 = 50;
const MAX_RECENT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub started: Instant,
    pub mode: ProxyMode,
    pub scan_stats: Arc<ScanStats>,
    pub retail: Arc<ResilientRequester>,
    pub market: Arc<ResilientRequester>,
    pub enrich_queue: Arc<WorkQueue<ProductRecord>>,
    pub scheduler: Arc<RestockScheduler>,
    pub store: SqliteStore,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/proxies", get(get_proxies))
        .route("/monitors", get(get_monitors))
        .route("/deals/recent", get(get_recent_deals))
        .route("/restocks/recent", get(get_recent_restocks))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

impl RecentQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_RECENT_LIMIT)
            .clamp(1, MAX_RECENT_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct RequestStatsResponse {
    pub retail: RequestStatsSnapshot,
    pub market: RequestStatsSnapshot,
    pub retail_delay_ms: u64,
    pub market_delay_ms: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub scan: ScanStatsSnapshot,
    pub requests: RequestStatsResponse,
    pub queues: Vec<QueueStats>,
    pub monitor: MonitorStatsSnapshot,
}

#[derive(Serialize)]
pub struct ProxiesResponse {
    pub mode: &'static str,
    pub metrics: Option<PoolMetrics>,
    pub proxies: Vec<ProxyView>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        scan: state.scan_stats.snapshot(),
        requests: RequestStatsResponse {
            retail: state.retail.stats().snapshot(),
            market: state.market.stats().snapshot(),
            retail_delay_ms: state.retail.pacer().current_delay().as_millis() as u64,
            market_delay_ms: state.market.pacer().current_delay().as_millis() as u64,
        },
        queues: vec![state.enrich_queue.stats(), state.scheduler.queue().stats()],
        monitor: state.scheduler.stats(),
    })
}

async fn get_proxies(State(state): State<ApiState>) -> Json<ProxiesResponse> {
    let pool = state.mode.pool();
    Json(ProxiesResponse {
        mode: state.mode.label(),
        metrics: pool.map(|p| p.metrics()),
        proxies: pool.map(|p| p.snapshot()).unwrap_or_default(),
    })
}

async fn get_monitors(State(state): State<ApiState>) -> Json<Vec<MonitorView>> {
    Json(state.scheduler.monitors())
}

async fn get_recent_deals(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<DealRow>>, AppError> {
    Ok(Json(state.store.recent_deals(params.limit()).await?))
}

async fn get_recent_restocks(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<RestockRow>>, AppError> {
    Ok(Json(state.store.recent_restocks(params.limit()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::fakes::{FakeMarket, FakeStore, FixedModel, RecordingNotifier};
    use crate::collab::{MemoryCache, Persistence};
    use crate::config::test_config;
    use crate::http::{HeaderProfile, RequesterConfig};
    use crate::monitor::MonitorConfig;
    use crate::proxy::list::ProxyEndpoint;
    use crate::proxy::ProxyPool;
    use crate::types::{DealRecord, ProfitEstimate, ProfitableProduct};
    use serde_json::Value;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn state(mode: ProxyMode) -> ApiState {
        let cfg = test_config();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool).await.unwrap();
        let requester = || {
            Arc::new(ResilientRequester::new(
                RequesterConfig::from_config(&cfg, None, HeaderProfile::Desktop),
                mode.clone(),
            ))
        };
        let monitor_cfg = MonitorConfig::from_config(&cfg);
        let scheduler = Arc::new(RestockScheduler::new(
            monitor_cfg.clone(),
            Arc::new(WorkQueue::new("monitor", 10, monitor_cfg.prediction_ttl)),
            Arc::new(FakeStore::default()),
            Arc::new(MemoryCache::new()),
            Arc::new(FakeMarket::default()),
            Arc::new(FixedModel(0.5)),
            Arc::new(RecordingNotifier::default()),
        ));
        ApiState {
            started: Instant::now(),
            mode: mode.clone(),
            scan_stats: Arc::new(ScanStats::new()),
            retail: requester(),
            market: requester(),
            enrich_queue: Arc::new(WorkQueue::new("enrich", 10, Duration::from_secs(60))),
            scheduler,
            store,
        }
    }

    async fn serve(state: ApiState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn get_json(url: String) -> Value {
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        resp.json().await.unwrap()
    }

    #[tokio::test]
    async fn health_reports_direct_mode() {
        let base = serve(state(ProxyMode::Direct).await).await;
        let body = get_json(format!("{base}/health")).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["proxy_mode"], "direct");
        assert!(body["active_proxies"].is_null());
    }

    #[tokio::test]
    async fn proxies_lists_pool() {
        let endpoint = ProxyEndpoint {
            scheme: "http".into(),
            host: "10.0.0.1".into(),
            port: 8080,
            username: None,
            password: None,
        };
        let pool = ProxyPool::new(vec![endpoint], "http://127.0.0.1:9/");
        let base = serve(state(ProxyMode::Pooled(pool)).await).await;
        let body = get_json(format!("{base}/proxies")).await;
        assert_eq!(body["mode"], "pooled");
        assert_eq!(body["metrics"]["total"], 1);
        assert_eq!(body["proxies"][0]["address"], "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn stats_and_monitors_reflect_scheduler() {
        let st = state(ProxyMode::Direct).await;
        st.scheduler
            .admit(
                vec![ProfitableProduct {
                    sku: "A".into(),
                    name: "Shoe A".into(),
                    retail_price: 100.0,
                    resale_price: 150.0,
                    net_profit: 50.0,
                    profit_margin: 50.0,
                    monthly_sales: 30,
                    sales_velocity: 1.0,
                    restock_probability: 0.2,
                    last_restock: None,
                }],
                1_700_000_000,
            )
            .await;
        let base = serve(st).await;

        let monitors = get_json(format!("{base}/monitors")).await;
        assert_eq!(monitors[0]["sku"], "A");
        assert_eq!(monitors[0]["name"], "Shoe A");

        let stats = get_json(format!("{base}/stats")).await;
        assert_eq!(stats["monitor"]["active"], 1);
        assert_eq!(stats["queues"][1]["name"], "monitor");
        assert_eq!(stats["queues"][1]["queued"], 1);
        assert!(stats["scan"]["p50_ms"].is_null());
    }

    #[tokio::test]
    async fn recent_deals_come_from_store() {
        let st = state(ProxyMode::Direct).await;
        for i in 0..3 {
            st.store
                .save_deal(&DealRecord {
                    sku: format!("S{i}"),
                    name: "Shoe".into(),
                    url: String::new(),
                    retail_price: 100.0,
                    resale_price: 150.0,
                    profit: ProfitEstimate {
                        net_profit: 50.0,
                        margin_pct: 50.0,
                        roi_pct: 33.3,
                    },
                    monthly_sales: 10,
                    found_at: 1_700_000_000 + i,
                })
                .await
                .unwrap();
        }
        let base = serve(st).await;
        let deals = get_json(format!("{base}/deals/recent?limit=2")).await;
        let deals = deals.as_array().unwrap();
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0]["sku"], "S2");

        let restocks = get_json(format!("{base}/restocks/recent")).await;
        assert!(restocks.as_array().unwrap().is_empty());
    }
}
