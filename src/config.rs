use std::time::Duration;

use crate::error::{AppError, Result};

pub const RETAIL_BASE_URL: &str = "https://www.hhv.de";
pub const MARKET_BASE_URL: &str = "https://sell-api.goat.com/api/v1/analytics";
pub const PROXY_PROBE_URL: &str = "https://www.google.com";

/// User agent presented by the resale-market app profile.
pub const MARKET_USER_AGENT: &str = "alias/1.33.1 (iPhone; iOS 17.5.1; Scale/3.00) Locale/en";

/// Starting score for every proxy loaded from the list.
pub const PROXY_INITIAL_SCORE: f64 = 1.0;
/// Multiplier applied on a successful request through a proxy.
pub const PROXY_SCORE_GAIN: f64 = 1.1;
/// Upper bound on a proxy score so one long-lived proxy cannot dominate forever.
pub const PROXY_SCORE_CAP: f64 = 10.0;
/// Lower bound on a proxy score.
pub const PROXY_SCORE_FLOOR: f64 = 0.01;
/// Multiplier applied when the proxy itself failed (timeout, refused, 407).
pub const PROXY_LOCAL_PENALTY: f64 = 0.5;
/// Multiplier applied when the target rate-limited a request through the proxy.
pub const TARGET_LIMITED_PENALTY: f64 = 0.9;
/// Consecutive proxy-local failures before a proxy is blacklisted.
pub const PROXY_FAILURE_THRESHOLD: u32 = 3;
/// Size of the high-score shortlist that `acquire` prefers.
pub const PROXY_TOP_K: usize = 3;
/// Fraction of acquisitions that ignore score and pick uniformly.
pub const PROXY_EXPLORATION_RATIO: f64 = 0.2;
/// Timeout for a revalidation probe through a blacklisted proxy.
pub const PROXY_PROBE_TIMEOUT_SECS: u64 = 10;

/// Number of recent latencies the pacer averages over.
pub const PACER_LATENCY_WINDOW: usize = 10;

/// Attempts per request when no proxy pool is configured.
pub const DIRECT_MAX_RETRIES: u32 = 3;

/// Pause between scan batches.
pub const SCAN_BATCH_PAUSE_MS: u64 = 1000;
/// Base delay for the orchestrator's per-item retry backoff.
pub const SCAN_ITEM_RETRY_BASE_MS: u64 = 1000;

/// Default priority for freshly discovered products in the enrichment queue.
pub const DEFAULT_ENRICH_PRIORITY: u32 = 50;
/// Maximum rows returned by the profitable-products query.
pub const PROFITABLE_QUERY_LIMIT: i64 = 100;

/// How often the queue expiry sweep and performance monitor run (seconds).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 60;
/// Minimum pause between monitor drain cycles.
pub const MONITOR_MIN_SLEEP_SECS: u64 = 1;
/// Concurrent availability checks per drain cycle.
pub const MONITOR_CHECK_CONCURRENCY: usize = 5;
/// A SKU with a confirmed restock is not monitored again for this long.
pub const RESTOCK_COOLDOWN_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Line-delimited proxy list (PROXY_FILE). None runs every request direct.
    pub proxy_file: Option<String>,
    pub proxy_probe_url: String,
    pub retail_base_url: String,
    pub market_base_url: String,
    /// Bearer token for the resale-market API (MARKET_AUTH_TOKEN)
    pub market_auth_token: Option<String>,
    /// Listing pages scanned every cycle (CANDIDATE_URLS, comma-separated)
    pub candidate_urls: Vec<String>,
    pub request_timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_cap: Duration,
    pub session_lifetime: Duration,
    pub session_max_requests: u32,
    pub scan_batch_size: usize,
    pub scan_concurrency: usize,
    pub scan_item_retries: u32,
    pub scan_interval: Duration,
    pub queue_capacity: usize,
    pub queue_ttl: Duration,
    /// Minimum net profit for a deal and for the profitable-products query (MIN_PROFIT)
    pub min_profit: f64,
    pub min_monthly_sales: u32,
    /// Minimum profit margin in percent before a SKU is monitored (MIN_PROFIT_MARGIN)
    pub min_profit_margin: f64,
    /// Minimum sales per day before a SKU is monitored (MIN_SALES_VELOCITY)
    pub min_sales_velocity: f64,
    /// Longest sleep between monitor drain cycles and the reseed cadence (MONITOR_INTERVAL_SECS)
    pub monitor_interval: Duration,
    pub min_check_interval: Duration,
    pub max_check_interval: Duration,
    pub prediction_ttl: Duration,
    /// Keep predictions in memory between reseeds (PREDICTION_CACHE). When
    /// off, every admission recomputes from the model.
    pub prediction_cache: bool,
    pub discord_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "engine.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            proxy_file: optional_var("PROXY_FILE"),
            proxy_probe_url: std::env::var("PROXY_PROBE_URL")
                .unwrap_or_else(|_| PROXY_PROBE_URL.to_string()),
            retail_base_url: std::env::var("RETAIL_BASE_URL")
                .unwrap_or_else(|_| RETAIL_BASE_URL.to_string()),
            market_base_url: std::env::var("MARKET_BASE_URL")
                .unwrap_or_else(|_| MARKET_BASE_URL.to_string()),
            market_auth_token: optional_var("MARKET_AUTH_TOKEN"),
            candidate_urls: std::env::var("CANDIDATE_URLS")
                .unwrap_or_else(|_| {
                    format!("{RETAIL_BASE_URL}/clothing/katalog/filter/schuhe-N10")
                })
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            request_timeout: Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", 30)),
            min_delay: Duration::from_millis(parse_var("MIN_DELAY_MS", 500)),
            max_delay: Duration::from_millis(parse_var("MAX_DELAY_MS", 5000)),
            backoff_cap: Duration::from_secs(parse_var("BACKOFF_CAP_SECS", 300)),
            session_lifetime: Duration::from_secs(parse_var("SESSION_LIFETIME_SECS", 1800)),
            session_max_requests: parse_var("SESSION_MAX_REQUESTS", 100),
            scan_batch_size: parse_var("SCAN_BATCH_SIZE", 100),
            scan_concurrency: parse_var::<usize>("SCAN_CONCURRENCY", 10).clamp(5, 50),
            scan_item_retries: parse_var("SCAN_ITEM_RETRIES", 3),
            scan_interval: Duration::from_secs(parse_var("SCAN_INTERVAL_SECS", 300)),
            queue_capacity: parse_var("QUEUE_CAPACITY", 1000),
            queue_ttl: Duration::from_secs(parse_var("QUEUE_TTL_SECS", 300)),
            min_profit: parse_var("MIN_PROFIT", 10.0),
            min_monthly_sales: parse_var("MIN_MONTHLY_SALES", 5),
            min_profit_margin: parse_var("MIN_PROFIT_MARGIN", 15.0),
            min_sales_velocity: parse_var("MIN_SALES_VELOCITY", 0.1),
            monitor_interval: Duration::from_secs(parse_var("MONITOR_INTERVAL_SECS", 300)),
            min_check_interval: Duration::from_secs(parse_var("MIN_CHECK_INTERVAL_SECS", 60)),
            max_check_interval: Duration::from_secs(parse_var("MAX_CHECK_INTERVAL_SECS", 900)),
            prediction_ttl: Duration::from_secs(parse_var("PREDICTION_TTL_SECS", 1800)),
            prediction_cache: parse_var("PREDICTION_CACHE", true),
            discord_webhook_url: optional_var("DISCORD_WEBHOOK_URL"),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(AppError::Config("SCAN_BATCH_SIZE must be greater than 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Config("QUEUE_CAPACITY must be greater than 0".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(AppError::Config("REQUEST_TIMEOUT_SECS must be greater than 0".to_string()));
        }
        if self.min_delay > self.max_delay {
            return Err(AppError::Config("MIN_DELAY_MS must not exceed MAX_DELAY_MS".to_string()));
        }
        if self.min_check_interval > self.max_check_interval {
            return Err(AppError::Config(
                "MIN_CHECK_INTERVAL_SECS must not exceed MAX_CHECK_INTERVAL_SECS".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() || self.scan_interval.is_zero() {
            return Err(AppError::Config("loop intervals must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        log_level: "debug".to_string(),
        db_path: ":memory:".to_string(),
        api_port: 0,
        proxy_file: None,
        proxy_probe_url: PROXY_PROBE_URL.to_string(),
        retail_base_url: RETAIL_BASE_URL.to_string(),
        market_base_url: MARKET_BASE_URL.to_string(),
        market_auth_token: None,
        candidate_urls: Vec::new(),
        request_timeout: Duration::from_secs(5),
        min_delay: Duration::ZERO,
        max_delay: Duration::from_millis(50),
        backoff_cap: Duration::from_millis(100),
        session_lifetime: Duration::from_secs(60),
        session_max_requests: 100,
        scan_batch_size: 100,
        scan_concurrency: 5,
        scan_item_retries: 3,
        scan_interval: Duration::from_secs(300),
        queue_capacity: 10,
        queue_ttl: Duration::from_secs(300),
        min_profit: 10.0,
        min_monthly_sales: 5,
        min_profit_margin: 15.0,
        min_sales_velocity: 0.1,
        monitor_interval: Duration::from_secs(300),
        min_check_interval: Duration::from_secs(60),
        max_check_interval: Duration::from_secs(900),
        prediction_ttl: Duration::from_secs(1800),
        prediction_cache: true,
        discord_webhook_url: None,
    }
}
