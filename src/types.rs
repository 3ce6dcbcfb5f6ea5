use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

/// Structured record produced by a page parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub sku: String,
    pub brand: String,
    pub model: String,
    pub price: f64,
    pub url: String,
}

impl ProductRecord {
    pub fn name(&self) -> String {
        format!("{} {}", self.brand, self.model).trim().to_string()
    }
}

/// Row returned by the profitable-products query; seeds the restock monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitableProduct {
    pub sku: String,
    pub name: String,
    pub retail_price: f64,
    pub resale_price: f64,
    pub net_profit: f64,
    pub profit_margin: f64,
    pub monthly_sales: u32,
    /// Sales per day
    pub sales_velocity: f64,
    pub restock_probability: f64,
    /// Unix seconds of the last confirmed restock.
    pub last_restock: Option<u64>,
}

/// Resale-market view of a SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub sku: String,
    pub lowest_ask: f64,
    pub monthly_sales: u32,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitEstimate {
    pub net_profit: f64,
    pub margin_pct: f64,
    pub roi_pct: f64,
}

impl ProfitEstimate {
    pub const ZERO: ProfitEstimate = ProfitEstimate {
        net_profit: 0.0,
        margin_pct: 0.0,
        roi_pct: 0.0,
    };
}

/// Partial product update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductUpdate {
    pub resale_price: Option<f64>,
    pub net_profit: Option<f64>,
    pub profit_margin: Option<f64>,
    pub monthly_sales: Option<u32>,
    pub sales_velocity: Option<f64>,
    pub restock_probability: Option<f64>,
    pub last_restock: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealRecord {
    pub sku: String,
    pub name: String,
    pub url: String,
    pub retail_price: f64,
    pub resale_price: f64,
    pub profit: ProfitEstimate,
    pub monthly_sales: u32,
    pub found_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestockRecord {
    pub sku: String,
    pub detected_at: u64,
    pub probability: f64,
    pub profit_margin: f64,
    pub sales_velocity: f64,
    /// Price model estimate of the resale price after the restock.
    pub expected_resale: f64,
    pub market: Option<MarketSnapshot>,
}

// ---------------------------------------------------------------------------
// Predictions
// ---------------------------------------------------------------------------

/// Scheduler state for one monitored SKU. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestockPrediction {
    pub sku: String,
    pub probability: f64,
    pub next_check: u64,
    pub priority: u32,
    pub last_check: u64,
    pub profit_margin: f64,
    pub sales_velocity: f64,
    pub check_count: u32,
}

// ---------------------------------------------------------------------------
// Request outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

/// Classification of one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// 429
    RateLimited,
    /// 403
    Forbidden,
    /// 503
    Unavailable,
    /// 407, the proxy rejected our credentials
    ProxyAuthRequired,
    Transport(TransportKind),
    Other(u16),
}

impl OutcomeKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => OutcomeKind::Success,
            429 => OutcomeKind::RateLimited,
            403 => OutcomeKind::Forbidden,
            503 => OutcomeKind::Unavailable,
            407 => OutcomeKind::ProxyAuthRequired,
            other => OutcomeKind::Other(other),
        }
    }

    /// Which party the failure is attributed to, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            OutcomeKind::RateLimited | OutcomeKind::Forbidden | OutcomeKind::Unavailable => {
                Some(FailureKind::TargetLimited)
            }
            OutcomeKind::ProxyAuthRequired | OutcomeKind::Transport(_) => {
                Some(FailureKind::ProxyLocal)
            }
            OutcomeKind::Success | OutcomeKind::Other(_) => None,
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::RateLimited => write!(f, "rate_limited(429)"),
            OutcomeKind::Forbidden => write!(f, "forbidden(403)"),
            OutcomeKind::Unavailable => write!(f, "unavailable(503)"),
            OutcomeKind::ProxyAuthRequired => write!(f, "proxy_auth_required(407)"),
            OutcomeKind::Transport(TransportKind::Timeout) => write!(f, "transport(timeout)"),
            OutcomeKind::Transport(TransportKind::Connect) => write!(f, "transport(connect)"),
            OutcomeKind::Transport(TransportKind::Other) => write!(f, "transport(other)"),
            OutcomeKind::Other(code) => write!(f, "status({code})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The proxy itself is bad: timeout, refused connection, 407.
    ProxyLocal,
    /// The remote site is rate limiting; the proxy may be fine elsewhere.
    TargetLimited,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::ProxyLocal => "proxy_local",
            FailureKind::TargetLimited => "target_limited",
        };
        write!(f, "{s}")
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Counters attached to the shutdown notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub uptime_secs: u64,
    pub scans: u64,
    pub products_found: u64,
    pub deals_found: u64,
    pub restocks_found: u64,
    pub abandoned_items: usize,
}

pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(OutcomeKind::from_status(200), OutcomeKind::Success);
        assert_eq!(
            OutcomeKind::from_status(429).failure_kind(),
            Some(FailureKind::TargetLimited)
        );
        assert_eq!(
            OutcomeKind::from_status(503).failure_kind(),
            Some(FailureKind::TargetLimited)
        );
        assert_eq!(OutcomeKind::from_status(404), OutcomeKind::Other(404));
        assert_eq!(OutcomeKind::from_status(404).failure_kind(), None);
    }

    #[test]
    fn proxy_auth_is_proxy_local() {
        assert_eq!(
            OutcomeKind::from_status(407).failure_kind(),
            Some(FailureKind::ProxyLocal)
        );
        assert_eq!(
            OutcomeKind::Transport(TransportKind::Timeout).failure_kind(),
            Some(FailureKind::ProxyLocal)
        );
    }

    #[test]
    fn product_name_joins_brand_and_model() {
        let p = ProductRecord {
            sku: "DD1391-100".into(),
            brand: "Nike".into(),
            model: "Dunk Low".into(),
            price: 110.0,
            url: "https://example.test/p/1".into(),
        };
        assert_eq!(p.name(), "Nike Dunk Low");
    }
}
