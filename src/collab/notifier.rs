use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::Notifier;
use crate::error::CollabError;
use crate::types::{DealRecord, RestockRecord, RunSummary};

const WEBHOOK_MAX_ATTEMPTS: u32 = 3;
const WEBHOOK_TIMEOUT_SECS: u64 = 10;
/// Longest server-requested wait honoured before a retry.
const WEBHOOK_MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

const COLOR_GREEN: u32 = 3_066_993;
const COLOR_RED: u32 = 15_158_332;
const COLOR_BLUE: u32 = 3_447_003;
const COLOR_TEAL: u32 = 45_015;

/// Posts embeds to a Discord webhook. Rate-limited posts wait for the
/// server's `Retry-After` when given, timeouts back off exponentially, and
/// any other failure gives up.
pub struct DiscordNotifier {
    client: reqwest::Client,
    webhook_url: String,
    retry_base: Duration,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, CollabError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .map_err(|e| CollabError::Notify(e.to_string()))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            retry_base: Duration::from_secs(1),
        })
    }

    async fn send(&self, embed: Value) -> Result<(), CollabError> {
        let body = json!({ "embeds": [embed] });
        for attempt in 0..WEBHOOK_MAX_ATTEMPTS {
            let mut server_wait = None;
            match self.client.post(&self.webhook_url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    server_wait = retry_after(resp.headers());
                    warn!(
                        attempt = attempt + 1,
                        max = WEBHOOK_MAX_ATTEMPTS,
                        retry_after = ?server_wait,
                        "Discord webhook rate limited"
                    );
                }
                Ok(resp) => {
                    return Err(CollabError::Notify(format!(
                        "webhook returned {}",
                        resp.status()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    warn!(
                        attempt = attempt + 1,
                        max = WEBHOOK_MAX_ATTEMPTS,
                        "Discord webhook timed out"
                    );
                }
                Err(e) => return Err(CollabError::Notify(e.to_string())),
            }
            if attempt + 1 < WEBHOOK_MAX_ATTEMPTS {
                let wait = server_wait
                    .map(|w| w.min(WEBHOOK_MAX_RETRY_AFTER))
                    .unwrap_or(self.retry_base * 2u32.pow(attempt));
                tokio::time::sleep(wait).await;
            }
        }
        Err(CollabError::Notify(format!(
            "webhook gave up after {WEBHOOK_MAX_ATTEMPTS} attempts"
        )))
    }
}

/// Seconds to wait from `Retry-After`, falling back to Discord's
/// `X-RateLimit-Reset-After`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset-after"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn deal_embed(deal: &DealRecord) -> Value {
    json!({
        "title": format!("Deal found: {}", deal.name),
        "description": format!(
            "**SKU:** {}\n**Retail:** {:.2}\n**Resale:** {:.2}\n**Profit:** {:.2}\n**Margin:** {:.1}%\n**ROI:** {:.1}%\n**Monthly sales:** {}",
            deal.sku,
            deal.retail_price,
            deal.resale_price,
            deal.profit.net_profit,
            deal.profit.margin_pct,
            deal.profit.roi_pct,
            deal.monthly_sales,
        ),
        "url": deal.url,
        "color": COLOR_BLUE,
    })
}

fn restock_embed(record: &RestockRecord) -> Value {
    let mut description = format!(
        "**SKU:** {}\n**Profit margin:** {:.1}%\n**Sales velocity:** {:.2}/day\n**Confidence:** {:.1}%\n**Expected resale:** {:.2}",
        record.sku,
        record.profit_margin,
        record.sales_velocity,
        record.probability * 100.0,
        record.expected_resale,
    );
    if let Some(m) = &record.market {
        description.push_str(&format!("\n**Lowest ask:** {:.2}", m.lowest_ask));
    }
    json!({
        "title": "Restock detected",
        "description": description,
        "color": COLOR_TEAL,
    })
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify_deal(&self, deal: &DealRecord) -> Result<(), CollabError> {
        self.send(deal_embed(deal)).await
    }

    async fn notify_restock(&self, record: &RestockRecord) -> Result<(), CollabError> {
        self.send(restock_embed(record)).await
    }

    async fn notify_error(&self, message: &str) -> Result<(), CollabError> {
        self.send(json!({
            "title": "Engine error",
            "description": message,
            "color": COLOR_RED,
        }))
        .await
    }

    async fn notify_startup(&self) -> Result<(), CollabError> {
        self.send(json!({
            "title": "Engine started",
            "color": COLOR_GREEN,
        }))
        .await
    }

    async fn notify_shutdown(&self, summary: &RunSummary) -> Result<(), CollabError> {
        self.send(json!({
            "title": "Engine stopped",
            "description": format!("Stopped after {:.2} hours", summary.uptime_secs as f64 / 3600.0),
            "color": COLOR_RED,
            "fields": [{
                "name": "Stats",
                "value": format!(
                    "Scans: {}\nProducts: {}\nDeals: {}\nRestocks: {}\nAbandoned work items: {}",
                    summary.scans,
                    summary.products_found,
                    summary.deals_found,
                    summary.restocks_found,
                    summary.abandoned_items,
                ),
            }],
        }))
        .await
    }
}

/// Latches an error condition so each episode is announced once. `raise`
/// notifies on the first call after construction or `clear`.
#[derive(Debug, Default)]
pub struct ErrorAlert {
    raised: AtomicBool,
}

impl ErrorAlert {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call sent the notification.
    pub async fn raise(&self, notifier: &dyn Notifier, message: &str) -> bool {
        if self.raised.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = notifier.notify_error(message).await {
            warn!("Error notification failed: {e}");
        }
        true
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_deal(&self, deal: &DealRecord) -> Result<(), CollabError> {
        info!(
            sku = %deal.sku,
            profit = deal.profit.net_profit,
            roi = deal.profit.roi_pct,
            "Deal found: {}",
            deal.name
        );
        Ok(())
    }

    async fn notify_restock(&self, record: &RestockRecord) -> Result<(), CollabError> {
        info!(
            sku = %record.sku,
            probability = record.probability,
            margin = record.profit_margin,
            "Restock detected"
        );
        Ok(())
    }

    async fn notify_error(&self, message: &str) -> Result<(), CollabError> {
        warn!("Engine error: {message}");
        Ok(())
    }

    async fn notify_startup(&self) -> Result<(), CollabError> {
        info!("Engine started");
        Ok(())
    }

    async fn notify_shutdown(&self, summary: &RunSummary) -> Result<(), CollabError> {
        info!(
            uptime_secs = summary.uptime_secs,
            deals = summary.deals_found,
            restocks = summary.restocks_found,
            abandoned = summary.abandoned_items,
            "Engine stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProfitEstimate;
    use crate::collab::fakes::RecordingNotifier;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    async fn webhook(statuses: Vec<StatusCode>) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let statuses = Arc::new(statuses);
        let app = Router::new().route(
            "/hook",
            post(move || {
                let counter = counter.clone();
                let statuses = statuses.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                    statuses
                        .get(n)
                        .copied()
                        .unwrap_or(StatusCode::NO_CONTENT)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), hits)
    }

    fn notifier(url: String) -> DiscordNotifier {
        let mut n = DiscordNotifier::new(url).unwrap();
        n.retry_base = Duration::from_millis(5);
        n
    }

    fn deal() -> DealRecord {
        DealRecord {
            sku: "A1".into(),
            name: "Nike Dunk".into(),
            url: "https://shop.test/a1".into(),
            retail_price: 100.0,
            resale_price: 160.0,
            profit: ProfitEstimate {
                net_profit: 60.0,
                margin_pct: 60.0,
                roi_pct: 37.5,
            },
            monthly_sales: 12,
            found_at: 0,
        }
    }

    #[tokio::test]
    async fn retries_rate_limited_webhook() {
        let (url, hits) = webhook(vec![StatusCode::TOO_MANY_REQUESTS]).await;
        notifier(url).notify_deal(&deal()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_on_other_errors() {
        let (url, hits) = webhook(vec![StatusCode::BAD_REQUEST]).await;
        let result = notifier(url).notify_error("boom").await;
        assert!(matches!(result, Err(CollabError::Notify(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_three_rate_limits() {
        let (url, hits) = webhook(vec![StatusCode::TOO_MANY_REQUESTS; 5]).await;
        assert!(notifier(url).notify_startup().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), WEBHOOK_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn rate_limit_waits_for_retry_after() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "0.05")]).into_response()
                    } else {
                        StatusCode::NO_CONTENT.into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // The exponential fallback alone would sleep for a minute.
        let mut n = DiscordNotifier::new(format!("http://{addr}/hook")).unwrap();
        n.retry_base = Duration::from_secs(60);
        tokio::time::timeout(Duration::from_secs(5), n.notify_deal(&deal()))
            .await
            .expect("Retry-After was not honoured")
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_after_prefers_standard_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("x-ratelimit-reset-after", "2.5".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(2500)));
        headers.insert("retry-after", "1".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(1)));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn error_alert_notifies_once_per_episode() {
        let notifier = RecordingNotifier::default();
        let alert = ErrorAlert::new();
        assert!(alert.raise(&notifier, "pool empty").await);
        assert!(!alert.raise(&notifier, "pool empty").await);
        alert.clear();
        assert!(alert.raise(&notifier, "pool empty again").await);
        assert_eq!(
            *notifier.errors.lock().unwrap(),
            vec!["pool empty".to_string(), "pool empty again".to_string()]
        );
    }

    #[test]
    fn restock_embed_mentions_lowest_ask() {
        let record = RestockRecord {
            sku: "S".into(),
            detected_at: 0,
            probability: 0.5,
            profit_margin: 20.0,
            sales_velocity: 1.0,
            expected_resale: 175.0,
            market: Some(crate::types::MarketSnapshot {
                sku: "S".into(),
                lowest_ask: 180.0,
                monthly_sales: 10,
                available: true,
            }),
        };
        let embed = restock_embed(&record);
        let desc = embed["description"].as_str().unwrap();
        assert!(desc.contains("180.00"));
        assert!(desc.contains("50.0%"));
    }
}
